use std::fmt;

use thiserror::Error;

use crate::tables::{CopyId, TableFault};
use crate::usage::ChainFault;

/// Why an image size was refused at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeViolation {
    NotPowerOfTwo,
    BelowMinimum { minimum: u64 },
    AboveMaximum { maximum: u64 },
}

impl fmt::Display for SizeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeViolation::NotPowerOfTwo => write!(f, "size is not a power of two"),
            SizeViolation::BelowMinimum { minimum } => {
                write!(f, "size is below the minimum of {} bytes", minimum)
            }
            SizeViolation::AboveMaximum { maximum } => {
                write!(f, "size is above the maximum of {} bytes", maximum)
            }
        }
    }
}

/// Main error type for card recovery
#[derive(Error, Debug)]
pub enum CardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memory mapping error: {0}")]
    Mmap(String),

    #[error("Invalid image size {size}: {violation}")]
    ImageSize { size: u64, violation: SizeViolation },

    #[error("Header checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    HeaderChecksum { stored: u32, computed: u32 },

    #[error("Header declares {declared_mbits} Mbit but image holds {actual_mbits} Mbit")]
    HeaderSizeMismatch { declared_mbits: u16, actual_mbits: u16 },

    #[error("Directory table copy {copy} rejected: {fault}")]
    DirectoryTable { copy: CopyId, fault: TableFault },

    #[error("Block table copy {copy} rejected: {fault}")]
    BlockTable { copy: CopyId, fault: TableFault },

    #[error("Block chain of directory slot {slot} is corrupt: {fault}")]
    ChainCorruption { slot: usize, fault: ChainFault },

    #[error("No valid directory table; card is open in scan-only mode")]
    ScanOnly,

    #[error("Invalid offset: requested offset {offset} exceeds image size {image_size}")]
    InvalidOffset { offset: u64, image_size: u64 },

    #[error("Invalid size: requested size {size} at offset {offset} exceeds image bounds (image size: {image_size})")]
    InvalidSize {
        offset: u64,
        size: u64,
        image_size: u64,
    },

    #[error("Directory slot {0} is empty or out of range")]
    InvalidSlot(usize),

    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl CardError {
    /// Errors that leave the card usable (possibly degraded) rather than refusing it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CardError::HeaderChecksum { .. }
                | CardError::HeaderSizeMismatch { .. }
                | CardError::DirectoryTable { .. }
                | CardError::BlockTable { .. }
                | CardError::ChainCorruption { .. }
        )
    }
}

/// Result type alias for card operations
pub type Result<T> = std::result::Result<T, CardError>;
