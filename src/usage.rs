use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CardError;
use crate::tables::{BlockLink, BlockTable, DirectoryTable};
use crate::types::Geometry;

/// Why a directory entry's block chain could not be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChainFault {
    #[error("block {0} is outside the data area")]
    OutOfRange(u16),

    #[error("chain revisits block {0}")]
    Cycle(u16),

    #[error("chain runs into free block {0}")]
    UnexpectedFree(u16),

    #[error("chain does not terminate within {0} blocks")]
    TooLong(u16),

    #[error("chain holds {actual} blocks but the entry declares {declared}")]
    LengthMismatch { declared: u16, actual: u16 },

    #[error("block {block} already belongs to slot {owner}")]
    Overlap { block: u16, owner: usize },
}

/// Trust level of an entry's block list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    /// Walked through a valid block table
    Verified(Vec<u16>),
    /// No valid block table: assumed contiguous from the first block
    Unverified(Vec<u16>),
    Corrupt(ChainFault),
}

impl ChainStatus {
    pub fn blocks(&self) -> &[u16] {
        match self {
            ChainStatus::Verified(blocks) | ChainStatus::Unverified(blocks) => blocks,
            ChainStatus::Corrupt(_) => &[],
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, ChainStatus::Corrupt(_))
    }
}

/// Follow an entry's chain through the block table.
///
/// The walk takes at most `block_count` steps, so it terminates on any
/// corruption, cycles included.
pub fn walk_chain(
    table: &BlockTable,
    first: u16,
    declared: u16,
    geometry: &Geometry,
) -> Result<Vec<u16>, ChainFault> {
    let limit = geometry.block_count() as usize;
    let mut visited = vec![false; limit];
    let mut chain = Vec::new();
    let mut current = first;
    let mut terminated = false;

    for _ in 0..limit {
        if !geometry.is_data_block(current) {
            return Err(ChainFault::OutOfRange(current));
        }
        if visited[current as usize] {
            return Err(ChainFault::Cycle(current));
        }
        visited[current as usize] = true;
        chain.push(current);

        match table.link(current) {
            None => return Err(ChainFault::OutOfRange(current)),
            Some(BlockLink::Free) => return Err(ChainFault::UnexpectedFree(current)),
            Some(BlockLink::EndOfChain) => {
                terminated = true;
                break;
            }
            Some(BlockLink::Next(next)) => current = next,
        }
    }

    if !terminated {
        return Err(ChainFault::TooLong(geometry.block_count()));
    }
    if chain.len() != declared as usize {
        return Err(ChainFault::LengthMismatch {
            declared,
            actual: chain.len() as u16,
        });
    }
    Ok(chain)
}

/// Fallback block list when no block table can be trusted
pub fn contiguous_chain(first: u16, declared: u16, geometry: &Geometry) -> Result<Vec<u16>, ChainFault> {
    let last = first as u32 + declared as u32;
    if !geometry.is_data_block(first) {
        return Err(ChainFault::OutOfRange(first));
    }
    if declared == 0 || last > geometry.block_count() as u32 {
        return Err(ChainFault::OutOfRange(last.min(u16::MAX as u32) as u16));
    }
    Ok((first..first + declared).collect())
}

/// Which blocks the active directory claims
#[derive(Debug, Clone)]
pub struct BlockUsageMap {
    geometry: Geometry,
    owners: Vec<Option<usize>>,
    chains: Vec<(usize, ChainStatus)>,
    free: Vec<u16>,
}

impl BlockUsageMap {
    /// Recompute the claimed set from the active tables.
    ///
    /// Without a directory nothing is claimed and every data block is free.
    /// Entries are processed in slot order; an entry reaching a block that an
    /// earlier slot owns is marked corrupt and claims nothing.
    pub fn rebuild(
        directory: Option<&DirectoryTable>,
        block_table: Option<&BlockTable>,
        geometry: &Geometry,
    ) -> Self {
        let mut owners = vec![None; geometry.block_count() as usize];
        let mut chains = Vec::new();

        if let Some(directory) = directory {
            for entry in &directory.entries {
                let walked = match block_table {
                    Some(table) => walk_chain(table, entry.first_block, entry.block_count, geometry)
                        .map(ChainStatus::Verified),
                    None => contiguous_chain(entry.first_block, entry.block_count, geometry)
                        .map(ChainStatus::Unverified),
                };

                let status = match walked {
                    Ok(status) => {
                        let overlap = status.blocks().iter().find_map(|&block| {
                            owners[block as usize].map(|owner| ChainFault::Overlap { block, owner })
                        });
                        match overlap {
                            Some(fault) => ChainStatus::Corrupt(fault),
                            None => {
                                for &block in status.blocks() {
                                    owners[block as usize] = Some(entry.slot);
                                }
                                status
                            }
                        }
                    }
                    Err(fault) => ChainStatus::Corrupt(fault),
                };

                if let ChainStatus::Corrupt(fault) = &status {
                    warn!(
                        "slot {} ({} {}): corrupt chain, blocks left to the scanner: {}",
                        entry.slot,
                        entry.game_code_str(),
                        entry.filename_str(),
                        fault
                    );
                }
                chains.push((entry.slot, status));
            }
        }

        let free: Vec<u16> = geometry
            .data_blocks()
            .filter(|&block| owners[block as usize].is_none())
            .collect();
        debug!(
            "usage map: {} claimed, {} free, {} corrupt entries",
            geometry.data_block_count() as usize - free.len(),
            free.len(),
            chains.iter().filter(|(_, s)| s.is_corrupt()).count()
        );

        Self {
            geometry: *geometry,
            owners,
            chains,
            free,
        }
    }

    /// Slot owning a block
    pub fn owner(&self, block: u16) -> Option<usize> {
        self.owners.get(block as usize).copied().flatten()
    }

    pub fn is_claimed(&self, block: u16) -> bool {
        self.owner(block).is_some()
    }

    /// Unclaimed data blocks in ascending order
    pub fn free_blocks(&self) -> &[u16] {
        &self.free
    }

    pub fn is_free(&self, block: u16) -> bool {
        self.geometry.is_data_block(block) && !self.is_claimed(block)
    }

    pub fn claimed_count(&self) -> usize {
        self.geometry.data_block_count() as usize - self.free.len()
    }

    pub fn chain(&self, slot: usize) -> Option<&ChainStatus> {
        self.chains.iter().find(|(s, _)| *s == slot).map(|(_, status)| status)
    }

    pub fn corrupt_entries(&self) -> impl Iterator<Item = (usize, ChainFault)> + '_ {
        self.chains.iter().filter_map(|(slot, status)| match status {
            ChainStatus::Corrupt(fault) => Some((*slot, *fault)),
            _ => None,
        })
    }

    pub fn diagnostics(&self) -> Vec<CardError> {
        self.corrupt_entries()
            .map(|(slot, fault)| CardError::ChainCorruption { slot, fault })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use crate::tables::{CopyId, DirectoryEntry};

    fn geometry() -> Geometry {
        Geometry::from_block_count(64).unwrap()
    }

    fn block_table(links: &[(u16, BlockLink)]) -> BlockTable {
        let geometry = geometry();
        let mut all = vec![BlockLink::Free; geometry.data_block_count() as usize];
        for (block, link) in links {
            all[(*block - 5) as usize] = *link;
        }
        let raw = BlockTable::encode(&all, 1, 0, ChecksumAlgorithm::Additive16);
        BlockTable::parse(CopyId::A, &raw, ChecksumAlgorithm::Additive16, &geometry).unwrap()
    }

    fn directory(entries: &[(usize, u16, u16)]) -> DirectoryTable {
        let entries = entries
            .iter()
            .map(|&(slot, first, count)| {
                let mut entry = DirectoryEntry::new(*b"GTST", *b"01", "file", first, count);
                entry.slot = slot;
                entry
            })
            .collect();
        DirectoryTable {
            copy: CopyId::A,
            update_counter: 0,
            stored_checksum: crate::checksum::ChecksumValue(0),
            entries,
        }
    }

    #[test]
    fn test_walk_linked_chain() {
        let table = block_table(&[
            (5, BlockLink::Next(8)),
            (8, BlockLink::Next(6)),
            (6, BlockLink::EndOfChain),
        ]);
        assert_eq!(walk_chain(&table, 5, 3, &geometry()), Ok(vec![5, 8, 6]));
        assert_eq!(
            walk_chain(&table, 5, 2, &geometry()),
            Err(ChainFault::LengthMismatch { declared: 2, actual: 3 })
        );
    }

    #[test]
    fn test_walk_detects_cycle() {
        let table = block_table(&[
            (5, BlockLink::Next(6)),
            (6, BlockLink::Next(7)),
            (7, BlockLink::Next(5)),
        ]);
        assert_eq!(walk_chain(&table, 5, 3, &geometry()), Err(ChainFault::Cycle(5)));
    }

    #[test]
    fn test_walk_detects_free_block() {
        let table = block_table(&[(5, BlockLink::Next(6))]);
        assert_eq!(walk_chain(&table, 5, 2, &geometry()), Err(ChainFault::UnexpectedFree(6)));
    }

    #[test]
    fn test_contiguous_fallback() {
        assert_eq!(contiguous_chain(10, 3, &geometry()), Ok(vec![10, 11, 12]));
        assert!(contiguous_chain(62, 3, &geometry()).is_err());
        assert!(contiguous_chain(2, 1, &geometry()).is_err());
    }

    #[test]
    fn test_rebuild_excludes_cyclic_entry() {
        let table = block_table(&[
            (5, BlockLink::EndOfChain),
            (10, BlockLink::Next(11)),
            (11, BlockLink::Next(10)),
        ]);
        let dir = directory(&[(0, 5, 1), (1, 10, 2)]);
        let usage = BlockUsageMap::rebuild(Some(&dir), Some(&table), &geometry());

        assert_eq!(usage.owner(5), Some(0));
        assert!(!usage.is_claimed(10));
        assert!(!usage.is_claimed(11));
        assert!(usage.free_blocks().contains(&10));
        assert_eq!(usage.claimed_count(), 1);
        assert!(matches!(usage.chain(1), Some(ChainStatus::Corrupt(ChainFault::Cycle(10)))));
        assert_eq!(usage.diagnostics().len(), 1);
    }

    #[test]
    fn test_rebuild_rejects_overlap() {
        let table = block_table(&[(5, BlockLink::Next(6)), (6, BlockLink::EndOfChain)]);
        let dir = directory(&[(0, 5, 2), (3, 6, 1)]);
        let usage = BlockUsageMap::rebuild(Some(&dir), Some(&table), &geometry());

        assert_eq!(usage.owner(6), Some(0));
        assert_eq!(
            usage.chain(3),
            Some(&ChainStatus::Corrupt(ChainFault::Overlap { block: 6, owner: 0 }))
        );
    }

    #[test]
    fn test_rebuild_without_block_table_is_unverified() {
        let dir = directory(&[(0, 20, 4)]);
        let usage = BlockUsageMap::rebuild(Some(&dir), None, &geometry());
        assert_eq!(usage.chain(0), Some(&ChainStatus::Unverified(vec![20, 21, 22, 23])));
        assert_eq!(usage.claimed_count(), 4);
    }

    #[test]
    fn test_rebuild_without_directory_frees_everything() {
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        assert_eq!(usage.free_blocks().len(), 59);
        assert_eq!(usage.free_blocks()[0], 5);
        assert!(!usage.is_free(4));
    }
}
