//! Byte ranges and metadata handed to an external save-container encoder.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tables::DirectoryEntry;

/// Hex SHA-256 of `data`
#[inline]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// One file's raw bytes in block order plus the directory record describing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    pub entry: DirectoryEntry,
    pub blocks: Vec<u16>,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub sha256: String,
}

impl ExportedFile {
    pub fn new(entry: DirectoryEntry, blocks: Vec<u16>, data: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&data);
        Self {
            entry,
            blocks,
            data,
            sha256,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File name safe for any filesystem: `GAME-MK-filename.raw`
    pub fn suggested_name(&self) -> String {
        let clean = |text: String| -> String {
            text.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
                .collect()
        };
        format!(
            "{}-{}-{}.raw",
            clean(self.entry.game_code_str()),
            clean(self.entry.maker_code_str()),
            clean(self.entry.filename_str())
        )
    }
}
