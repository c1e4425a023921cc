//! Synthetic card images.
//!
//! Writes a formatted card with consistent header, directory and block
//! tables, then lets the caller damage it in controlled ways. Used by the
//! test suites and the scanner benchmark.

use crate::error::{CardError, Result};
use crate::format::CardFormat;
use crate::header::{CardHeader, Encoding};
use crate::tables::directory::DIRECTORY_CAPACITY;
use crate::tables::{BlockLink, BlockTable, DirectoryEntry, DirectoryTable};
use crate::types::{
    Geometry, BLOCK_SIZE, BLOCK_TABLE_A_BLOCK, BLOCK_TABLE_B_BLOCK, DIRECTORY_A_BLOCK, DIRECTORY_B_BLOCK,
    FIRST_DATA_BLOCK, HEADER_BLOCK,
};

/// Byte flipped by [`CardBuilder::corrupt_block`]; inside every checksummed range
const DAMAGE_OFFSET: usize = 0x100;

#[derive(Debug, Clone)]
pub struct CardBuilder {
    geometry: Geometry,
    format: CardFormat,
    encoding: Encoding,
    entries: Vec<DirectoryEntry>,
    links: Vec<BlockLink>,
    image: Vec<u8>,
    directory_counters: (u16, u16),
    block_table_counters: (u16, u16),
    damaged: Vec<u16>,
}

impl CardBuilder {
    /// Blank formatted card of `block_count` blocks
    pub fn new(block_count: u16) -> Result<Self> {
        let geometry = Geometry::from_block_count(block_count)?;
        Ok(Self {
            geometry,
            format: CardFormat::standard(),
            encoding: Encoding::Ansi,
            entries: Vec::new(),
            links: vec![BlockLink::Free; geometry.data_block_count() as usize],
            image: vec![0u8; geometry.image_size() as usize],
            directory_counters: (0, 0),
            block_table_counters: (0, 0),
            damaged: Vec::new(),
        })
    }

    pub fn with_format(mut self, format: CardFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Update counters written to copies A and B of each table
    pub fn with_counters(mut self, directory: (u16, u16), block_table: (u16, u16)) -> Self {
        self.directory_counters = directory;
        self.block_table_counters = block_table;
        self
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Add a file occupying `blocks` in chain order and write `data` across them.
    ///
    /// Returns the directory slot used.
    pub fn add_file(
        &mut self,
        game_code: [u8; 4],
        maker_code: [u8; 2],
        filename: &str,
        blocks: &[u16],
        data: &[u8],
    ) -> Result<usize> {
        if self.entries.len() >= DIRECTORY_CAPACITY {
            return Err(CardError::InvalidSlot(self.entries.len()));
        }
        if blocks.is_empty() {
            return Err(CardError::InvalidArgument("file needs at least one block".to_string()));
        }
        if data.len() > blocks.len() * BLOCK_SIZE {
            return Err(CardError::InvalidArgument(format!(
                "{} bytes do not fit in {} blocks",
                data.len(),
                blocks.len()
            )));
        }
        for (i, &block) in blocks.iter().enumerate() {
            if !self.geometry.is_data_block(block) {
                return Err(CardError::InvalidArgument(format!("block {} is not a data block", block)));
            }
            if self.link(block) != Some(BlockLink::Free) || blocks[..i].contains(&block) {
                return Err(CardError::InvalidArgument(format!("block {} is already allocated", block)));
            }
        }

        for (pair, &block) in blocks.windows(2).zip(blocks.iter()) {
            self.set_link(block, BlockLink::Next(pair[1]));
        }
        if let Some(&last) = blocks.last() {
            self.set_link(last, BlockLink::EndOfChain);
        }
        for (chunk, &block) in data.chunks(BLOCK_SIZE).zip(blocks.iter()) {
            self.write_block(block, chunk);
        }

        let entry = DirectoryEntry::new(game_code, maker_code, filename, blocks[0], blocks.len() as u16);
        self.add_entry(entry)
    }

    /// Add a directory entry as given, without touching the block table
    pub fn add_entry(&mut self, mut entry: DirectoryEntry) -> Result<usize> {
        let slot = self.entries.len();
        if slot >= DIRECTORY_CAPACITY {
            return Err(CardError::InvalidSlot(slot));
        }
        entry.slot = slot;
        self.entries.push(entry.with_computed_checksum());
        Ok(slot)
    }

    fn link(&self, block: u16) -> Option<BlockLink> {
        let index = block.checked_sub(FIRST_DATA_BLOCK)? as usize;
        self.links.get(index).copied()
    }

    /// Overwrite one block-table link; out-of-range blocks are ignored
    pub fn set_link(&mut self, block: u16, link: BlockLink) -> &mut Self {
        if let Some(index) = block.checked_sub(FIRST_DATA_BLOCK) {
            if let Some(slot) = self.links.get_mut(index as usize) {
                *slot = link;
            }
        }
        self
    }

    /// Write bytes at the start of a block, clipped to the block
    pub fn write_block(&mut self, block: u16, bytes: &[u8]) -> &mut Self {
        let start = block as usize * BLOCK_SIZE;
        let len = bytes.len().min(BLOCK_SIZE);
        if let Some(target) = self.image.get_mut(start..start + len) {
            target.copy_from_slice(&bytes[..len]);
        }
        self
    }

    /// Flip a checksummed byte of `block` after the tables are written
    pub fn corrupt_block(&mut self, block: u16) -> &mut Self {
        self.damaged.push(block);
        self
    }

    /// Render the image
    pub fn build(&self) -> Vec<u8> {
        let mut image = self.image.clone();

        let header = CardHeader::new(self.geometry, self.encoding);
        header.write_to(block_mut(&mut image, HEADER_BLOCK), self.format.header);

        let (dir_a, dir_b) = self.directory_counters;
        block_mut(&mut image, DIRECTORY_A_BLOCK)
            .copy_from_slice(&DirectoryTable::encode(&self.entries, dir_a, self.format.directory));
        block_mut(&mut image, DIRECTORY_B_BLOCK)
            .copy_from_slice(&DirectoryTable::encode(&self.entries, dir_b, self.format.directory));

        let last_allocated = self
            .links
            .iter()
            .rposition(|link| *link != BlockLink::Free)
            .map_or(FIRST_DATA_BLOCK - 1, |i| i as u16 + FIRST_DATA_BLOCK);
        let (bat_a, bat_b) = self.block_table_counters;
        block_mut(&mut image, BLOCK_TABLE_A_BLOCK).copy_from_slice(&BlockTable::encode(
            &self.links,
            bat_a,
            last_allocated,
            self.format.block_table,
        ));
        block_mut(&mut image, BLOCK_TABLE_B_BLOCK).copy_from_slice(&BlockTable::encode(
            &self.links,
            bat_b,
            last_allocated,
            self.format.block_table,
        ));

        for &block in &self.damaged {
            if let Some(byte) = image.get_mut(block as usize * BLOCK_SIZE + DAMAGE_OFFSET) {
                *byte ^= 0xA5;
            }
        }
        image
    }
}

fn block_mut(image: &mut [u8], block: u16) -> &mut [u8] {
    let start = block as usize * BLOCK_SIZE;
    &mut image[start..start + BLOCK_SIZE]
}
