use crate::bytes::{read_u16_be, write_u16_be};
use crate::checksum::{self, ChecksumAlgorithm, ChecksumValue};
use crate::tables::{CopyId, TableFault};
use crate::types::{Geometry, BLOCK_SIZE, FIRST_DATA_BLOCK};

const BAT_CHECKSUM: usize = 0x0000;
const BAT_CHECKSUMMED_FROM: usize = 0x0004;
const BAT_UPDATE_COUNTER: usize = 0x0004;
const BAT_FREE_BLOCKS: usize = 0x0006;
const BAT_LAST_ALLOCATED: usize = 0x0008;
const BAT_MAP: usize = 0x000A;

/// Map value of an unallocated block
pub const LINK_FREE: u16 = 0x0000;
/// Map value of the last block of a chain
pub const LINK_END: u16 = 0xFFFF;

/// Allocation state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLink {
    Free,
    EndOfChain,
    Next(u16),
}

impl BlockLink {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            LINK_FREE => BlockLink::Free,
            LINK_END => BlockLink::EndOfChain,
            next => BlockLink::Next(next),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            BlockLink::Free => LINK_FREE,
            BlockLink::EndOfChain => LINK_END,
            BlockLink::Next(next) => next,
        }
    }
}

/// One parsed copy of the block allocation table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    pub copy: CopyId,
    pub update_counter: u16,
    pub free_blocks: u16,
    pub last_allocated: u16,
    pub stored_checksum: ChecksumValue,
    /// Raw map values for data blocks, index 0 is block 5
    links: Vec<u16>,
}

impl BlockTable {
    /// Parse and validate one block table copy
    pub fn parse(
        copy: CopyId,
        block: &[u8],
        algorithm: ChecksumAlgorithm,
        geometry: &Geometry,
    ) -> Result<Self, TableFault> {
        if block.len() < BLOCK_SIZE {
            return Err(TableFault::Truncated);
        }

        let stored_checksum =
            checksum::read_stored(algorithm, &block[BAT_CHECKSUM..]).ok_or(TableFault::Truncated)?;
        let computed = checksum::compute(algorithm, &block[BAT_CHECKSUMMED_FROM..BLOCK_SIZE]);
        if computed != stored_checksum {
            return Err(TableFault::ChecksumMismatch {
                stored: stored_checksum.as_u32(),
                computed: computed.as_u32(),
            });
        }

        let update_counter = read_u16_be(block, BAT_UPDATE_COUNTER).ok_or(TableFault::Truncated)?;
        let free_blocks = read_u16_be(block, BAT_FREE_BLOCKS).ok_or(TableFault::Truncated)?;
        let last_allocated = read_u16_be(block, BAT_LAST_ALLOCATED).ok_or(TableFault::Truncated)?;

        let mut links = Vec::with_capacity(geometry.data_block_count() as usize);
        let mut counted_free: u16 = 0;
        for block_index in geometry.data_blocks() {
            let offset = BAT_MAP + (block_index - FIRST_DATA_BLOCK) as usize * 2;
            let raw = read_u16_be(block, offset).ok_or(TableFault::Truncated)?;
            match BlockLink::from_raw(raw) {
                BlockLink::Free => counted_free += 1,
                BlockLink::EndOfChain => {}
                BlockLink::Next(next) if geometry.is_data_block(next) => {}
                BlockLink::Next(next) => {
                    return Err(TableFault::InvalidLink {
                        block: block_index,
                        value: next,
                    })
                }
            }
            links.push(raw);
        }

        if counted_free != free_blocks {
            return Err(TableFault::FreeCountMismatch {
                stored: free_blocks,
                counted: counted_free,
            });
        }

        Ok(Self {
            copy,
            update_counter,
            free_blocks,
            last_allocated,
            stored_checksum,
            links,
        })
    }

    /// Link of a data block; `None` for reserved or out-of-range blocks
    pub fn link(&self, block: u16) -> Option<BlockLink> {
        let index = block.checked_sub(FIRST_DATA_BLOCK)? as usize;
        self.links.get(index).copied().map(BlockLink::from_raw)
    }

    /// Serialize a block table copy from per-data-block links
    pub fn encode(
        links: &[BlockLink],
        update_counter: u16,
        last_allocated: u16,
        algorithm: ChecksumAlgorithm,
    ) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let free = links.iter().filter(|l| **l == BlockLink::Free).count() as u16;

        write_u16_be(&mut block, BAT_UPDATE_COUNTER, update_counter);
        write_u16_be(&mut block, BAT_FREE_BLOCKS, free);
        write_u16_be(&mut block, BAT_LAST_ALLOCATED, last_allocated);
        for (i, link) in links.iter().enumerate() {
            let offset = BAT_MAP + i * 2;
            if offset + 2 > BLOCK_SIZE {
                break;
            }
            write_u16_be(&mut block, offset, link.to_raw());
        }

        let sum = checksum::compute(algorithm, &block[BAT_CHECKSUMMED_FROM..BLOCK_SIZE]);
        checksum::write_stored(algorithm, sum, &mut block[BAT_CHECKSUM..]);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::from_block_count(64).unwrap()
    }

    fn links_with_chain() -> Vec<BlockLink> {
        let mut links = vec![BlockLink::Free; geometry().data_block_count() as usize];
        // chain 5 -> 6 -> 9
        links[0] = BlockLink::Next(6);
        links[1] = BlockLink::Next(9);
        links[4] = BlockLink::EndOfChain;
        links
    }

    #[test]
    fn test_parse_encoded_table() {
        let block = BlockTable::encode(&links_with_chain(), 7, 9, ChecksumAlgorithm::Additive16);
        let table = BlockTable::parse(CopyId::A, &block, ChecksumAlgorithm::Additive16, &geometry()).unwrap();

        assert_eq!(table.update_counter, 7);
        assert_eq!(table.free_blocks, 59 - 3);
        assert_eq!(table.link(5), Some(BlockLink::Next(6)));
        assert_eq!(table.link(9), Some(BlockLink::EndOfChain));
        assert_eq!(table.link(10), Some(BlockLink::Free));
        assert_eq!(table.link(4), None);
        assert_eq!(table.link(64), None);
    }

    #[test]
    fn test_rejects_out_of_range_link() {
        let mut links = links_with_chain();
        links[2] = BlockLink::Next(3);
        let block = BlockTable::encode(&links, 1, 0, ChecksumAlgorithm::Crc32);
        assert_eq!(
            BlockTable::parse(CopyId::B, &block, ChecksumAlgorithm::Crc32, &geometry()),
            Err(TableFault::InvalidLink { block: 7, value: 3 })
        );
    }

    #[test]
    fn test_rejects_free_count_mismatch() {
        let mut block = BlockTable::encode(&links_with_chain(), 1, 0, ChecksumAlgorithm::Additive16);
        write_u16_be(&mut block, BAT_FREE_BLOCKS, 1);
        let sum = checksum::compute(ChecksumAlgorithm::Additive16, &block[BAT_CHECKSUMMED_FROM..]);
        checksum::write_stored(ChecksumAlgorithm::Additive16, sum, &mut block[BAT_CHECKSUM..]);

        assert!(matches!(
            BlockTable::parse(CopyId::A, &block, ChecksumAlgorithm::Additive16, &geometry()),
            Err(TableFault::FreeCountMismatch { stored: 1, counted: 56 })
        ));
    }

    #[test]
    fn test_rejects_checksum_mismatch() {
        let mut block = BlockTable::encode(&links_with_chain(), 1, 0, ChecksumAlgorithm::Additive16);
        block[BAT_MAP + 20] ^= 0x80;
        assert!(matches!(
            BlockTable::parse(CopyId::A, &block, ChecksumAlgorithm::Additive16, &geometry()),
            Err(TableFault::ChecksumMismatch { .. })
        ));
    }
}
