use serde::{Deserialize, Serialize};

use crate::error::{CardError, Result, SizeViolation};
use crate::scanner::RecoveredFileEntry;

/// Size of one card block in bytes
pub const BLOCK_SIZE: usize = 0x2000;

/// Blocks 0..5 hold the header and the two copies of each table
pub const FIRST_DATA_BLOCK: u16 = 5;

pub const HEADER_BLOCK: u16 = 0;
pub const DIRECTORY_A_BLOCK: u16 = 1;
pub const DIRECTORY_B_BLOCK: u16 = 2;
pub const BLOCK_TABLE_A_BLOCK: u16 = 3;
pub const BLOCK_TABLE_B_BLOCK: u16 = 4;

/// 1 Mbit of card capacity is 16 blocks
pub const BLOCKS_PER_MBIT: u16 = 16;

/// Smallest supported card: 4 Mbit
pub const MIN_BLOCK_COUNT: u16 = 64;

/// Largest supported card: 128 Mbit
pub const MAX_BLOCK_COUNT: u16 = 2048;

pub const MIN_IMAGE_SIZE: u64 = MIN_BLOCK_COUNT as u64 * BLOCK_SIZE as u64;
pub const MAX_IMAGE_SIZE: u64 = MAX_BLOCK_COUNT as u64 * BLOCK_SIZE as u64;

/// Newtype wrapper for byte offsets in card images
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl Offset {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Newtype wrapper for sizes in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size(pub u64);

impl Size {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Block layout of a card image, derived from its total size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    block_count: u16,
}

impl Geometry {
    /// Validate an image size and derive the block count.
    ///
    /// The size must be a power of two between [`MIN_IMAGE_SIZE`] and
    /// [`MAX_IMAGE_SIZE`]; anything else is refused rather than rounded.
    pub fn from_image_size(size: u64) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(CardError::ImageSize {
                size,
                violation: SizeViolation::NotPowerOfTwo,
            });
        }
        if size < MIN_IMAGE_SIZE {
            return Err(CardError::ImageSize {
                size,
                violation: SizeViolation::BelowMinimum {
                    minimum: MIN_IMAGE_SIZE,
                },
            });
        }
        if size > MAX_IMAGE_SIZE {
            return Err(CardError::ImageSize {
                size,
                violation: SizeViolation::AboveMaximum {
                    maximum: MAX_IMAGE_SIZE,
                },
            });
        }

        Ok(Self {
            block_count: (size / BLOCK_SIZE as u64) as u16,
        })
    }

    /// Geometry for a block count; same rules as [`Geometry::from_image_size`]
    pub fn from_block_count(block_count: u16) -> Result<Self> {
        Self::from_image_size(block_count as u64 * BLOCK_SIZE as u64)
    }

    pub fn block_count(&self) -> u16 {
        self.block_count
    }

    pub fn image_size(&self) -> u64 {
        self.block_count as u64 * BLOCK_SIZE as u64
    }

    /// Number of blocks available to files
    pub fn data_block_count(&self) -> u16 {
        self.block_count - FIRST_DATA_BLOCK
    }

    pub fn size_mbits(&self) -> u16 {
        self.block_count / BLOCKS_PER_MBIT
    }

    pub fn is_data_block(&self, block: u16) -> bool {
        block >= FIRST_DATA_BLOCK && block < self.block_count
    }

    pub fn block_offset(&self, block: u16) -> Offset {
        Offset::new(block as u64 * BLOCK_SIZE as u64)
    }

    pub fn data_blocks(&self) -> std::ops::Range<u16> {
        FIRST_DATA_BLOCK..self.block_count
    }
}

/// Lost-file scan configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Drop descriptors whose game region does not fit the card encoding
    pub region_filter: bool,

    /// Descriptor count from which a block's candidates are tried in parallel
    pub parallel_threshold: usize,

    /// Emit a block progress update every N scanned blocks (0 = only at the end)
    pub progress_interval: usize,

    /// Number of blocks handed to a search expression, starting at the candidate block
    pub match_window_blocks: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            region_filter: true,
            parallel_threshold: 64,
            progress_interval: 1,
            match_window_blocks: 1,
        }
    }
}

impl ScanConfig {
    pub fn new(region_filter: bool, parallel_threshold: usize) -> Self {
        Self {
            region_filter,
            parallel_threshold,
            ..Default::default()
        }
    }

    pub fn with_match_window(mut self, blocks: usize) -> Self {
        self.match_window_blocks = blocks.max(1);
        self
    }
}

/// How a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Completed,
    /// Stopped by the cancel token; results gathered so far are kept
    Cancelled,
}

/// Progress update emitted during a lost-file scan
#[derive(Debug, Clone)]
pub enum ScanProgress {
    /// Candidate blocks processed out of the total
    Blocks { scanned: usize, total: usize },
    /// A file was recovered at the block just scanned
    Recovered(RecoveredFileEntry),
    /// Final message of every scan
    Finished { found: usize, status: ScanStatus },
}

/// Scan statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub blocks_total: usize,
    pub blocks_scanned: usize,
    pub descriptors: usize,
    pub recovered: usize,
    pub verified: usize,
    pub heuristic: usize,
    pub duration_secs: f64,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completion_percentage(&self) -> f32 {
        if self.blocks_total == 0 {
            100.0
        } else {
            (self.blocks_scanned as f32 / self.blocks_total as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_bounds() {
        assert_eq!(Geometry::from_image_size(MIN_IMAGE_SIZE).unwrap().block_count(), 64);
        assert_eq!(Geometry::from_image_size(MAX_IMAGE_SIZE).unwrap().block_count(), 2048);
        assert!(matches!(
            Geometry::from_image_size(MIN_IMAGE_SIZE / 2),
            Err(CardError::ImageSize {
                violation: SizeViolation::BelowMinimum { .. },
                ..
            })
        ));
        assert!(matches!(
            Geometry::from_image_size(MAX_IMAGE_SIZE * 2),
            Err(CardError::ImageSize {
                violation: SizeViolation::AboveMaximum { .. },
                ..
            })
        ));
        assert!(matches!(
            Geometry::from_image_size(MIN_IMAGE_SIZE + BLOCK_SIZE as u64),
            Err(CardError::ImageSize {
                violation: SizeViolation::NotPowerOfTwo,
                ..
            })
        ));
        assert!(Geometry::from_image_size(0).is_err());
    }

    #[test]
    fn test_geometry_ranges() {
        let geometry = Geometry::from_block_count(100).unwrap_err();
        assert!(matches!(geometry, CardError::ImageSize { .. }));

        let geometry = Geometry::from_block_count(256).unwrap();
        assert_eq!(geometry.size_mbits(), 16);
        assert_eq!(geometry.data_block_count(), 251);
        assert!(!geometry.is_data_block(4));
        assert!(geometry.is_data_block(5));
        assert!(!geometry.is_data_block(256));
        assert_eq!(geometry.block_offset(2).as_u64(), 0x4000);
    }

    #[test]
    fn test_scan_config_alignment() {
        let config = ScanConfig::default().with_match_window(0);
        assert_eq!(config.match_window_blocks, 1);
        assert!(config.region_filter);
    }

    #[test]
    fn test_stats_completion() {
        let mut stats = ScanStats::new();
        assert_eq!(stats.completion_percentage(), 100.0);
        stats.blocks_total = 4;
        stats.blocks_scanned = 1;
        assert_eq!(stats.completion_percentage(), 25.0);
    }
}
