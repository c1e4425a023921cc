use log::warn;
use serde::{Deserialize, Serialize};

use crate::bytes::{read_u16_be, read_u32_be, read_u64_be, write_u16_be, write_u32_be, write_u64_be};
use crate::checksum::{self, ChecksumAlgorithm, ChecksumValue};
use crate::error::CardError;
use crate::types::{Geometry, BLOCK_SIZE};

const HDR_SERIAL: usize = 0x000;
const HDR_FORMAT_TIME: usize = 0x00C;
const HDR_SRAM_BIAS: usize = 0x014;
const HDR_SRAM_LANGUAGE: usize = 0x018;
const HDR_DEVICE_ID: usize = 0x020;
const HDR_SIZE_MBITS: usize = 0x022;
const HDR_ENCODING: usize = 0x024;
const HDR_CHECKSUM: usize = 0x1FC;

const SERIAL_LEN: usize = 12;

/// Character encoding declared by the card, which doubles as its region hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Ansi,
    ShiftJis,
    Unknown(u16),
}

impl Encoding {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Encoding::Ansi,
            1 => Encoding::ShiftJis,
            other => Encoding::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            Encoding::Ansi => 0,
            Encoding::ShiftJis => 1,
            Encoding::Unknown(raw) => raw,
        }
    }

    pub fn region(self) -> Region {
        match self {
            Encoding::Ansi => Region::International,
            Encoding::ShiftJis => Region::Japan,
            Encoding::Unknown(_) => Region::Unknown,
        }
    }
}

/// Market a card (or a save) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    Japan,
    International,
    Unknown,
}

impl Region {
    /// Region from the fourth character of a game code
    pub fn from_game_code(code: &[u8]) -> Region {
        match code.get(3) {
            Some(b'J') => Region::Japan,
            Some(c) if c.is_ascii_uppercase() => Region::International,
            _ => Region::Unknown,
        }
    }

    /// Unknown on either side is compatible with everything
    pub fn is_compatible(self, other: Region) -> bool {
        self == Region::Unknown || other == Region::Unknown || self == other
    }
}

/// Parsed card header (block 0)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardHeader {
    pub serial: [u8; SERIAL_LEN],
    pub format_time: u64,
    pub sram_bias: u32,
    pub sram_language: u32,
    pub device_id: u16,
    pub size_mbits: u16,
    pub encoding: Encoding,
    pub stored_checksum: ChecksumValue,
    pub checksum_valid: bool,
}

impl CardHeader {
    /// Fresh header for a card of the given geometry
    pub fn new(geometry: Geometry, encoding: Encoding) -> Self {
        Self {
            serial: [0; SERIAL_LEN],
            format_time: 0,
            sram_bias: 0,
            sram_language: 0,
            device_id: 0,
            size_mbits: geometry.size_mbits(),
            encoding,
            stored_checksum: ChecksumValue(0),
            checksum_valid: true,
        }
    }

    /// Parse the header block; `None` when the block is truncated
    pub fn parse(block: &[u8], algorithm: ChecksumAlgorithm) -> Option<Self> {
        if block.len() < BLOCK_SIZE {
            return None;
        }

        let mut serial = [0u8; SERIAL_LEN];
        serial.copy_from_slice(block.get(HDR_SERIAL..HDR_SERIAL + SERIAL_LEN)?);

        let stored_checksum = checksum::read_stored(algorithm, block.get(HDR_CHECKSUM..)?)?;
        let checksum_valid =
            checksum::verify(algorithm, &block[..HDR_CHECKSUM], stored_checksum);

        Some(Self {
            serial,
            format_time: read_u64_be(block, HDR_FORMAT_TIME)?,
            sram_bias: read_u32_be(block, HDR_SRAM_BIAS)?,
            sram_language: read_u32_be(block, HDR_SRAM_LANGUAGE)?,
            device_id: read_u16_be(block, HDR_DEVICE_ID)?,
            size_mbits: read_u16_be(block, HDR_SIZE_MBITS)?,
            encoding: Encoding::from_raw(read_u16_be(block, HDR_ENCODING)?),
            stored_checksum,
            checksum_valid,
        })
    }

    /// Recoverable problems with this header against the image geometry.
    ///
    /// A header with a bad checksum is not trusted for its size field, so only
    /// the checksum is reported in that case.
    pub fn validate(&self, geometry: &Geometry, algorithm: ChecksumAlgorithm, block: &[u8]) -> Vec<CardError> {
        let mut issues = Vec::new();

        if !self.checksum_valid {
            let computed = checksum::compute(algorithm, &block[..HDR_CHECKSUM.min(block.len())]);
            warn!(
                "header checksum mismatch (stored {}, computed {}); header fields ignored",
                self.stored_checksum, computed
            );
            issues.push(CardError::HeaderChecksum {
                stored: self.stored_checksum.as_u32(),
                computed: computed.as_u32(),
            });
            return issues;
        }

        if self.size_mbits != geometry.size_mbits() {
            warn!(
                "header declares {} Mbit, image holds {} Mbit",
                self.size_mbits,
                geometry.size_mbits()
            );
            issues.push(CardError::HeaderSizeMismatch {
                declared_mbits: self.size_mbits,
                actual_mbits: geometry.size_mbits(),
            });
        }

        issues
    }

    /// Region hint, only when the header can be trusted
    pub fn region(&self) -> Region {
        if self.checksum_valid {
            self.encoding.region()
        } else {
            Region::Unknown
        }
    }

    /// Serialize into a header block, computing the checksum
    pub fn write_to(&self, block: &mut [u8], algorithm: ChecksumAlgorithm) {
        block[HDR_SERIAL..HDR_SERIAL + SERIAL_LEN].copy_from_slice(&self.serial);
        write_u64_be(block, HDR_FORMAT_TIME, self.format_time);
        write_u32_be(block, HDR_SRAM_BIAS, self.sram_bias);
        write_u32_be(block, HDR_SRAM_LANGUAGE, self.sram_language);
        write_u16_be(block, HDR_DEVICE_ID, self.device_id);
        write_u16_be(block, HDR_SIZE_MBITS, self.size_mbits);
        write_u16_be(block, HDR_ENCODING, self.encoding.to_raw());

        let sum = checksum::compute(algorithm, &block[..HDR_CHECKSUM]);
        checksum::write_stored(algorithm, sum, &mut block[HDR_CHECKSUM..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_block(geometry: Geometry, encoding: Encoding) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        CardHeader::new(geometry, encoding).write_to(&mut block, ChecksumAlgorithm::Additive16);
        block
    }

    #[test]
    fn test_parse_written_header() {
        let geometry = Geometry::from_block_count(2048).unwrap();
        let block = header_block(geometry, Encoding::ShiftJis);
        let header = CardHeader::parse(&block, ChecksumAlgorithm::Additive16).unwrap();

        assert!(header.checksum_valid);
        assert_eq!(header.size_mbits, 128);
        assert_eq!(header.region(), Region::Japan);
        assert!(header.validate(&geometry, ChecksumAlgorithm::Additive16, &block).is_empty());
    }

    #[test]
    fn test_checksum_failure_is_reported() {
        let geometry = Geometry::from_block_count(64).unwrap();
        let mut block = header_block(geometry, Encoding::Ansi);
        block[HDR_DEVICE_ID] ^= 0x55;

        let header = CardHeader::parse(&block, ChecksumAlgorithm::Additive16).unwrap();
        assert!(!header.checksum_valid);
        assert_eq!(header.region(), Region::Unknown);

        let issues = header.validate(&geometry, ChecksumAlgorithm::Additive16, &block);
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], CardError::HeaderChecksum { .. }));
    }

    #[test]
    fn test_size_mismatch() {
        let small = Geometry::from_block_count(64).unwrap();
        let large = Geometry::from_block_count(256).unwrap();
        let block = header_block(small, Encoding::Ansi);
        let header = CardHeader::parse(&block, ChecksumAlgorithm::Additive16).unwrap();

        let issues = header.validate(&large, ChecksumAlgorithm::Additive16, &block);
        assert!(matches!(
            issues.as_slice(),
            [CardError::HeaderSizeMismatch { declared_mbits: 4, actual_mbits: 16 }]
        ));
    }

    #[test]
    fn test_truncated_block() {
        assert!(CardHeader::parse(&[0u8; 16], ChecksumAlgorithm::Additive16).is_none());
    }

    #[test]
    fn test_region_from_game_code() {
        assert_eq!(Region::from_game_code(b"GALJ"), Region::Japan);
        assert_eq!(Region::from_game_code(b"GALE"), Region::International);
        assert_eq!(Region::from_game_code(b"GA"), Region::Unknown);
        assert!(Region::Japan.is_compatible(Region::Unknown));
        assert!(!Region::Japan.is_compatible(Region::International));
    }
}
