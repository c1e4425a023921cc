//! Checksum algorithms used by card tables and by save formats.
//!
//! The card format changed checksum schemes between firmware revisions, so
//! every consumer names the algorithm it uses instead of relying on a single
//! global choice. All functions here are pure.

use serde::{Deserialize, Serialize};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// Pair of 16-bit sums over big-endian words: plain and inverted
    Additive16,
    /// Wrapping 16-bit sum of bytes
    Sum16,
    /// IEEE CRC-32
    Crc32,
}

/// A computed or stored checksum, widened to 32 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChecksumValue(pub u32);

impl ChecksumValue {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl ChecksumAlgorithm {
    /// Number of bytes the stored value occupies on disk
    pub fn width(&self) -> usize {
        match self {
            ChecksumAlgorithm::Additive16 => 4,
            ChecksumAlgorithm::Sum16 => 2,
            ChecksumAlgorithm::Crc32 => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Additive16 => "additive16",
            ChecksumAlgorithm::Sum16 => "sum16",
            ChecksumAlgorithm::Crc32 => "crc32",
        }
    }
}

/// Compute the checksum of `data` under `algorithm`
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> ChecksumValue {
    match algorithm {
        ChecksumAlgorithm::Additive16 => additive16(data),
        ChecksumAlgorithm::Sum16 => sum16(data),
        ChecksumAlgorithm::Crc32 => ChecksumValue(crc32fast::hash(data)),
    }
}

/// Check `data` against an expected checksum
pub fn verify(algorithm: ChecksumAlgorithm, data: &[u8], expected: ChecksumValue) -> bool {
    compute(algorithm, data) == expected
}

/// Decode a stored checksum; `None` when `bytes` is shorter than the algorithm width
pub fn read_stored(algorithm: ChecksumAlgorithm, bytes: &[u8]) -> Option<ChecksumValue> {
    let raw = bytes.get(..algorithm.width())?;
    let value = raw.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Some(ChecksumValue(value))
}

/// Encode a checksum into `out`, big-endian, using the algorithm width.
///
/// Returns `false` without writing when `out` is too short.
pub fn write_stored(algorithm: ChecksumAlgorithm, value: ChecksumValue, out: &mut [u8]) -> bool {
    let width = algorithm.width();
    let Some(slot) = out.get_mut(..width) else {
        return false;
    };
    let bytes = value.0.to_be_bytes();
    slot.copy_from_slice(&bytes[4 - width..]);
    true
}

fn additive16(data: &[u8]) -> ChecksumValue {
    let mut sum: u16 = 0;
    let mut inverted: u16 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        let value = u16::from_be_bytes([word[0], word[1]]);
        sum = sum.wrapping_add(value);
        inverted = inverted.wrapping_add(value ^ 0xFFFF);
    }
    // odd trailing byte counts as the high half of a final word
    if let [last] = words.remainder() {
        let value = (*last as u16) << 8;
        sum = sum.wrapping_add(value);
        inverted = inverted.wrapping_add(value ^ 0xFFFF);
    }

    if sum == 0xFFFF {
        sum = 0;
    }
    if inverted == 0xFFFF {
        inverted = 0;
    }

    ChecksumValue(((sum as u32) << 16) | inverted as u32)
}

fn sum16(data: &[u8]) -> ChecksumValue {
    let sum = data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    ChecksumValue(sum as u32)
}
