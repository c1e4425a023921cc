use serde::{Deserialize, Serialize};

use crate::bytes::read_uint_be;
use crate::checksum::{self, ChecksumAlgorithm};
use crate::types::BLOCK_SIZE;

/// Unit of a length field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    Bytes,
    Blocks,
}

/// Size field embedded in a matched file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthField {
    /// Offset from the start of the matched block
    pub offset: usize,
    /// 1, 2 or 4 bytes, big-endian
    pub width: usize,
    pub unit: LengthUnit,
    /// Multiplier applied to the raw value
    pub scale: u64,
}

impl LengthField {
    /// Extent in blocks read from `header`.
    ///
    /// `None` when the field is unreadable, zero or larger than `max_blocks`.
    #[inline]
    pub fn blocks(&self, header: &[u8], max_blocks: u16) -> Option<u16> {
        let raw = read_uint_be(header, self.offset, self.width)?;
        let scaled = raw.checked_mul(self.scale)?;
        let blocks = match self.unit {
            LengthUnit::Bytes => scaled.div_ceil(BLOCK_SIZE as u64),
            LengthUnit::Blocks => scaled,
        };
        if blocks == 0 || blocks > max_blocks as u64 {
            return None;
        }
        Some(blocks as u16)
    }
}

/// Byte position relative to the recovered extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldLocation {
    FromStart(usize),
    FromEnd(usize),
}

impl FieldLocation {
    /// Absolute offset inside an extent of `len` bytes
    #[inline]
    pub fn resolve(&self, len: usize) -> Option<usize> {
        match *self {
            FieldLocation::FromStart(offset) => (offset <= len).then_some(offset),
            FieldLocation::FromEnd(back) => len.checked_sub(back),
        }
    }
}

/// Per-file checksum carried inside the file's own bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumField {
    pub algorithm: ChecksumAlgorithm,
    /// Where the stored value sits
    pub stored_at: FieldLocation,
    /// Covered range, start inclusive
    pub covered_from: FieldLocation,
    /// Covered range, end exclusive
    pub covered_to: FieldLocation,
}

/// Outcome of checking a recovered file's checksum field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChecksumCheck {
    /// Descriptor defines no checksum field
    NotDefined,
    Matched,
    Mismatch { stored: u32, computed: u32 },
    /// Field or covered range falls outside the recovered extent
    OutOfRange,
}

impl ChecksumCheck {
    pub fn is_match(&self) -> bool {
        matches!(self, ChecksumCheck::Matched)
    }
}

/// Evaluate an optional checksum field against the recovered extent bytes
pub fn check_checksum(field: Option<&ChecksumField>, extent: &[u8]) -> ChecksumCheck {
    let Some(field) = field else {
        return ChecksumCheck::NotDefined;
    };

    let len = extent.len();
    let (Some(stored_at), Some(from), Some(to)) = (
        field.stored_at.resolve(len),
        field.covered_from.resolve(len),
        field.covered_to.resolve(len),
    ) else {
        return ChecksumCheck::OutOfRange;
    };
    if from >= to {
        return ChecksumCheck::OutOfRange;
    }

    let Some(stored) = checksum::read_stored(field.algorithm, &extent[stored_at..]) else {
        return ChecksumCheck::OutOfRange;
    };
    let computed = checksum::compute(field.algorithm, &extent[from..to]);

    if computed == stored {
        ChecksumCheck::Matched
    } else {
        ChecksumCheck::Mismatch {
            stored: stored.as_u32(),
            computed: computed.as_u32(),
        }
    }
}
