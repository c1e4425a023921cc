//! Redundant directory and block-allocation tables.
//!
//! Each table exists twice on the card. Both copies are parsed and validated
//! on their own, then [`select`] decides which one is authoritative. The
//! directory and the block table are selected independently of each other.

pub mod block_table;
pub mod directory;

pub use block_table::{BlockLink, BlockTable};
pub use directory::{DirectoryEntry, DirectoryTable, Permissions};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::disk::RawImage;
use crate::error::{CardError, Result};
use crate::format::CardFormat;
use crate::types::{
    Geometry, BLOCK_TABLE_A_BLOCK, BLOCK_TABLE_B_BLOCK, DIRECTORY_A_BLOCK, DIRECTORY_B_BLOCK,
};

/// Which physical copy of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyId {
    A,
    B,
}

impl std::fmt::Display for CopyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyId::A => write!(f, "A"),
            CopyId::B => write!(f, "B"),
        }
    }
}

/// Field-range violation of a single directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EntryFault {
    #[error("first block {0} is outside the data area")]
    FirstBlockOutOfRange(u16),

    #[error("block count {0} is out of range")]
    BadBlockCount(u16),

    #[error("permission bits 0x{0:02X} are not defined")]
    UndefinedPermissions(u8),

    #[error("entry checksum mismatch: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

/// Reason a table copy is not structurally valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableFault {
    #[error("table block is truncated")]
    Truncated,

    #[error("checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("slot {slot}: {fault}")]
    InvalidEntry { slot: usize, fault: EntryFault },

    #[error("block {block} links to invalid block {value}")]
    InvalidLink { block: u16, value: u16 },

    #[error("free block count {stored} disagrees with map ({counted} free)")]
    FreeCountMismatch { stored: u16, counted: u16 },
}

/// Outcome of choosing between two table copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionOutcome {
    /// Only this copy passed validation
    SingleValid(CopyId),
    /// Both passed; this one carries the newer update counter (A on ties)
    BothValid(CopyId),
    NoneValid,
}

impl SelectionOutcome {
    pub fn active(&self) -> Option<CopyId> {
        match self {
            SelectionOutcome::SingleValid(copy) | SelectionOutcome::BothValid(copy) => Some(*copy),
            SelectionOutcome::NoneValid => None,
        }
    }
}

/// Pick the authoritative copy from the update counters of the valid copies
pub fn select(counter_a: Option<u16>, counter_b: Option<u16>) -> SelectionOutcome {
    match (counter_a, counter_b) {
        (Some(a), Some(b)) => {
            if b > a {
                SelectionOutcome::BothValid(CopyId::B)
            } else {
                SelectionOutcome::BothValid(CopyId::A)
            }
        }
        (Some(_), None) => SelectionOutcome::SingleValid(CopyId::A),
        (None, Some(_)) => SelectionOutcome::SingleValid(CopyId::B),
        (None, None) => SelectionOutcome::NoneValid,
    }
}

type CopyResult<T> = std::result::Result<T, TableFault>;

/// Both copies of both tables plus the active choice for each
#[derive(Debug, Clone)]
pub struct TableSet {
    directories: [CopyResult<DirectoryTable>; 2],
    block_tables: [CopyResult<BlockTable>; 2],
    directory_selection: SelectionOutcome,
    block_table_selection: SelectionOutcome,
    active_directory: Option<CopyId>,
    active_block_table: Option<CopyId>,
}

fn index(copy: CopyId) -> usize {
    match copy {
        CopyId::A => 0,
        CopyId::B => 1,
    }
}

impl TableSet {
    /// Parse all four table blocks and select the active copies
    pub fn parse(image: &RawImage, geometry: &Geometry, format: &CardFormat) -> Result<Self> {
        let parse_directory = |copy: CopyId, block: u16| -> Result<CopyResult<DirectoryTable>> {
            let bytes = image.block(block)?;
            Ok(DirectoryTable::parse(copy, bytes, format.directory, geometry))
        };
        let parse_block_table = |copy: CopyId, block: u16| -> Result<CopyResult<BlockTable>> {
            let bytes = image.block(block)?;
            Ok(BlockTable::parse(copy, bytes, format.block_table, geometry))
        };

        let directories = [
            parse_directory(CopyId::A, DIRECTORY_A_BLOCK)?,
            parse_directory(CopyId::B, DIRECTORY_B_BLOCK)?,
        ];
        let block_tables = [
            parse_block_table(CopyId::A, BLOCK_TABLE_A_BLOCK)?,
            parse_block_table(CopyId::B, BLOCK_TABLE_B_BLOCK)?,
        ];

        for (copy, result) in [CopyId::A, CopyId::B].iter().zip(directories.iter()) {
            match result {
                Ok(table) => debug!(
                    "directory {}: valid, counter {}, {} entries",
                    copy,
                    table.update_counter,
                    table.entries.len()
                ),
                Err(fault) => warn!("directory {}: rejected ({})", copy, fault),
            }
        }
        for (copy, result) in [CopyId::A, CopyId::B].iter().zip(block_tables.iter()) {
            match result {
                Ok(table) => debug!(
                    "block table {}: valid, counter {}, {} free",
                    copy, table.update_counter, table.free_blocks
                ),
                Err(fault) => warn!("block table {}: rejected ({})", copy, fault),
            }
        }

        let directory_selection = select(
            directories[0].as_ref().ok().map(|t| t.update_counter),
            directories[1].as_ref().ok().map(|t| t.update_counter),
        );
        let block_table_selection = select(
            block_tables[0].as_ref().ok().map(|t| t.update_counter),
            block_tables[1].as_ref().ok().map(|t| t.update_counter),
        );
        info!(
            "table selection: directory {:?}, block table {:?}",
            directory_selection, block_table_selection
        );

        Ok(Self {
            directories,
            block_tables,
            directory_selection,
            block_table_selection,
            active_directory: directory_selection.active(),
            active_block_table: block_table_selection.active(),
        })
    }

    pub fn directory_selection(&self) -> SelectionOutcome {
        self.directory_selection
    }

    pub fn block_table_selection(&self) -> SelectionOutcome {
        self.block_table_selection
    }

    pub fn active_directory_copy(&self) -> Option<CopyId> {
        self.active_directory
    }

    pub fn active_block_table_copy(&self) -> Option<CopyId> {
        self.active_block_table
    }

    /// The active directory table, if any copy is valid
    pub fn directory(&self) -> Option<&DirectoryTable> {
        let copy = self.active_directory?;
        self.directories[index(copy)].as_ref().ok()
    }

    /// The active block table, if any copy is valid
    pub fn block_table(&self) -> Option<&BlockTable> {
        let copy = self.active_block_table?;
        self.block_tables[index(copy)].as_ref().ok()
    }

    pub fn directory_copy(&self, copy: CopyId) -> std::result::Result<&DirectoryTable, TableFault> {
        self.directories[index(copy)].as_ref().map_err(|fault| *fault)
    }

    pub fn block_table_copy(&self, copy: CopyId) -> std::result::Result<&BlockTable, TableFault> {
        self.block_tables[index(copy)].as_ref().map_err(|fault| *fault)
    }

    /// Make other valid copies active. Invalid copies are refused.
    pub fn reselect(&mut self, directory: CopyId, block_table: CopyId) -> Result<()> {
        if let Err(fault) = &self.directories[index(directory)] {
            return Err(CardError::DirectoryTable {
                copy: directory,
                fault: *fault,
            });
        }
        if let Err(fault) = &self.block_tables[index(block_table)] {
            return Err(CardError::BlockTable {
                copy: block_table,
                fault: *fault,
            });
        }
        info!("table selection forced: directory {}, block table {}", directory, block_table);
        self.active_directory = Some(directory);
        self.active_block_table = Some(block_table);
        Ok(())
    }

    /// Per-copy rejections as recoverable errors
    pub fn diagnostics(&self) -> Vec<CardError> {
        let mut issues = Vec::new();
        for copy in [CopyId::A, CopyId::B] {
            if let Err(fault) = &self.directories[index(copy)] {
                issues.push(CardError::DirectoryTable { copy, fault: *fault });
            }
        }
        for copy in [CopyId::A, CopyId::B] {
            if let Err(fault) = &self.block_tables[index(copy)] {
                issues.push(CardError::BlockTable { copy, fault: *fault });
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_single_valid() {
        assert_eq!(select(Some(3), None), SelectionOutcome::SingleValid(CopyId::A));
        assert_eq!(select(None, Some(0)), SelectionOutcome::SingleValid(CopyId::B));
        assert_eq!(select(None, None), SelectionOutcome::NoneValid);
        assert_eq!(select(None, None).active(), None);
    }

    #[test]
    fn test_select_prefers_newer_counter() {
        assert_eq!(select(Some(4), Some(5)), SelectionOutcome::BothValid(CopyId::B));
        assert_eq!(select(Some(5), Some(4)), SelectionOutcome::BothValid(CopyId::A));
    }

    #[test]
    fn test_select_tie_goes_to_a() {
        assert_eq!(select(Some(9), Some(9)), SelectionOutcome::BothValid(CopyId::A));
        assert_eq!(select(Some(9), Some(9)).active(), Some(CopyId::A));
    }
}
