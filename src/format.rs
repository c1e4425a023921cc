use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;

/// Checksum used by every directory entry's own checksum field (2 bytes on disk)
pub const ENTRY_CHECKSUM: ChecksumAlgorithm = ChecksumAlgorithm::Sum16;

/// Checksum algorithms of one card firmware revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFormat {
    pub header: ChecksumAlgorithm,
    pub directory: ChecksumAlgorithm,
    pub block_table: ChecksumAlgorithm,
}

impl CardFormat {
    /// Dual additive checksums everywhere
    pub const fn standard() -> Self {
        Self {
            header: ChecksumAlgorithm::Additive16,
            directory: ChecksumAlgorithm::Additive16,
            block_table: ChecksumAlgorithm::Additive16,
        }
    }

    /// Later revision: CRC-32 over the tables, header unchanged
    pub const fn revised() -> Self {
        Self {
            header: ChecksumAlgorithm::Additive16,
            directory: ChecksumAlgorithm::Crc32,
            block_table: ChecksumAlgorithm::Crc32,
        }
    }
}

impl Default for CardFormat {
    fn default() -> Self {
        Self::standard()
    }
}
