//! The card aggregate: one opened image with its validated tables.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::disk::RawImage;
use crate::error::{CardError, Result};
use crate::export::ExportedFile;
use crate::format::CardFormat;
use crate::header::{CardHeader, Region};
use crate::scanner::{CancelToken, LostFileScanner, ProgressSink, RecoveredFileEntry, ScanOutcome};
use crate::signatures::DescriptorSet;
use crate::tables::{CopyId, DirectoryEntry, SelectionOutcome, TableSet};
use crate::types::{Geometry, ScanConfig, HEADER_BLOCK};
use crate::usage::{BlockUsageMap, ChainStatus};

/// A directory entry of the active table together with its walked chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveFile {
    pub entry: DirectoryEntry,
    pub chain: ChainStatus,
}

impl ActiveFile {
    pub fn blocks(&self) -> &[u16] {
        self.chain.blocks()
    }

    pub fn is_corrupt(&self) -> bool {
        self.chain.is_corrupt()
    }
}

/// Anything that can be exported
#[derive(Debug, Clone, Copy)]
pub enum FileRef<'a> {
    Active(&'a ActiveFile),
    Recovered(&'a RecoveredFileEntry),
}

impl<'a> From<&'a ActiveFile> for FileRef<'a> {
    fn from(file: &'a ActiveFile) -> Self {
        FileRef::Active(file)
    }
}

impl<'a> From<&'a RecoveredFileEntry> for FileRef<'a> {
    fn from(entry: &'a RecoveredFileEntry) -> Self {
        FileRef::Recovered(entry)
    }
}

/// An opened memory card image.
///
/// The buffer is read-only after open, so a card can be shared between a
/// scan running on a worker and listing on another thread.
#[derive(Debug)]
pub struct CardImage {
    image: RawImage,
    geometry: Geometry,
    format: CardFormat,
    header: Option<CardHeader>,
    tables: TableSet,
    usage: BlockUsageMap,
    diagnostics: Vec<CardError>,
}

impl CardImage {
    /// Open an in-memory image with the standard checksum format
    pub fn open(bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        Self::open_with_format(bytes, CardFormat::standard())
    }

    pub fn open_with_format(bytes: impl Into<Arc<[u8]>>, format: CardFormat) -> Result<Self> {
        Self::from_image(RawImage::from_bytes(bytes), format)
    }

    /// Read an image file; no further I/O happens after this returns
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_path_with_format(path, CardFormat::standard())
    }

    pub fn open_path_with_format<P: AsRef<Path>>(path: P, format: CardFormat) -> Result<Self> {
        Self::from_image(RawImage::open(path)?, format)
    }

    /// Size is checked before anything else is parsed. Only a size violation
    /// fails; damaged headers and tables are recorded as diagnostics.
    pub fn from_image(image: RawImage, format: CardFormat) -> Result<Self> {
        let geometry = Geometry::from_image_size(image.size().as_u64())?;

        let header_block = image.block(HEADER_BLOCK)?;
        let header = CardHeader::parse(header_block, format.header);
        let tables = TableSet::parse(&image, &geometry, &format)?;
        let usage = BlockUsageMap::rebuild(tables.directory(), tables.block_table(), &geometry);

        let mut card = Self {
            image,
            geometry,
            format,
            header,
            tables,
            usage,
            diagnostics: Vec::new(),
        };
        card.diagnostics = card.collect_diagnostics();

        info!(
            "opened {} KiB card: {} blocks, {} claimed, {} free, {} diagnostics{}",
            geometry.image_size() / 1024,
            geometry.block_count(),
            card.usage.claimed_count(),
            card.usage.free_blocks().len(),
            card.diagnostics.len(),
            if card.is_scan_only() { ", scan-only" } else { "" }
        );
        Ok(card)
    }

    fn collect_diagnostics(&self) -> Vec<CardError> {
        let mut issues = Vec::new();
        if let Some(header) = &self.header {
            if let Ok(block) = self.image.block(HEADER_BLOCK) {
                issues.extend(header.validate(&self.geometry, self.format.header, block));
            }
        }
        issues.extend(self.tables.diagnostics());
        if self.tables.directory().is_none() {
            warn!("no valid directory copy; only lost-file scanning is available");
            issues.push(CardError::ScanOnly);
        }
        issues.extend(self.usage.diagnostics());
        issues
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn format(&self) -> &CardFormat {
        &self.format
    }

    pub fn header(&self) -> Option<&CardHeader> {
        self.header.as_ref()
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn usage(&self) -> &BlockUsageMap {
        &self.usage
    }

    /// Recoverable problems found while opening
    pub fn diagnostics(&self) -> &[CardError] {
        &self.diagnostics
    }

    pub fn directory_selection(&self) -> SelectionOutcome {
        self.tables.directory_selection()
    }

    pub fn block_table_selection(&self) -> SelectionOutcome {
        self.tables.block_table_selection()
    }

    /// No directory copy is valid
    pub fn is_scan_only(&self) -> bool {
        self.tables.directory().is_none()
    }

    /// Card region from the header encoding; unknown when the header is damaged
    pub fn region(&self) -> Region {
        self.header.as_ref().map_or(Region::Unknown, CardHeader::region)
    }

    /// Entries of the active directory with their chains, in slot order
    pub fn list_active_files(&self) -> Result<Vec<ActiveFile>> {
        let directory = self.tables.directory().ok_or(CardError::ScanOnly)?;
        Ok(directory
            .entries
            .iter()
            .filter_map(|entry| {
                self.usage.chain(entry.slot).map(|chain| ActiveFile {
                    entry: entry.clone(),
                    chain: chain.clone(),
                })
            })
            .collect())
    }

    pub fn active_file(&self, slot: usize) -> Result<ActiveFile> {
        self.list_active_files()?
            .into_iter()
            .find(|file| file.entry.slot == slot)
            .ok_or(CardError::InvalidSlot(slot))
    }

    /// Scan unclaimed blocks with the default configuration
    pub fn scan_for_lost_files<S>(&self, descriptors: &DescriptorSet, sink: &S, cancel: &CancelToken) -> ScanOutcome
    where
        S: ProgressSink + ?Sized,
    {
        self.scan_with_config(descriptors, ScanConfig::default(), sink, cancel)
    }

    pub fn scan_with_config<S>(
        &self,
        descriptors: &DescriptorSet,
        config: ScanConfig,
        sink: &S,
        cancel: &CancelToken,
    ) -> ScanOutcome
    where
        S: ProgressSink + ?Sized,
    {
        LostFileScanner::new(&self.image, self.geometry, &self.usage, descriptors, config)
            .with_region(self.region())
            .scan(sink, cancel)
    }

    /// Bytes of a file in block order with its directory record
    pub fn export_file<'a>(&self, file: impl Into<FileRef<'a>>) -> Result<ExportedFile> {
        let (entry, blocks) = match file.into() {
            FileRef::Active(active) => match &active.chain {
                ChainStatus::Corrupt(fault) => {
                    return Err(CardError::ChainCorruption {
                        slot: active.entry.slot,
                        fault: *fault,
                    })
                }
                chain => (active.entry.clone(), chain.blocks().to_vec()),
            },
            FileRef::Recovered(recovered) => (recovered.to_directory_entry(), recovered.blocks.clone()),
        };

        let mut data = Vec::with_capacity(blocks.len() * crate::types::BLOCK_SIZE);
        for &block in &blocks {
            if !self.geometry.is_data_block(block) {
                return Err(CardError::InvalidArgument(format!("block {} is not a data block", block)));
            }
            data.extend_from_slice(self.image.block(block)?);
        }
        Ok(ExportedFile::new(entry, blocks, data))
    }

    /// Force other valid table copies and rebuild the usage map
    pub fn reselect(&mut self, directory: CopyId, block_table: CopyId) -> Result<()> {
        self.tables.reselect(directory, block_table)?;
        self.usage = BlockUsageMap::rebuild(self.tables.directory(), self.tables.block_table(), &self.geometry);
        self.diagnostics = self.collect_diagnostics();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CardBuilder;
    use crate::error::SizeViolation;
    use crate::header::Encoding;
    use crate::scanner::NoProgress;
    use crate::types::{BLOCK_SIZE, DIRECTORY_B_BLOCK, BLOCK_TABLE_A_BLOCK};

    fn small_card() -> CardBuilder {
        let mut builder = CardBuilder::new(64).unwrap();
        builder
            .add_file(*b"GALE", *b"01", "smash", &[5, 6, 9], b"first file")
            .unwrap();
        builder.add_file(*b"GZLE", *b"01", "zelda", &[7], b"second").unwrap();
        builder
    }

    #[test]
    fn test_open_rejects_bad_sizes() {
        let err = CardImage::open(vec![0u8; 3 * BLOCK_SIZE * 32]).unwrap_err();
        assert!(matches!(
            err,
            CardError::ImageSize { violation: SizeViolation::NotPowerOfTwo, .. }
        ));
        let err = CardImage::open(vec![0u8; 32 * BLOCK_SIZE]).unwrap_err();
        assert!(matches!(err, CardError::ImageSize { violation: SizeViolation::BelowMinimum { .. }, .. }));
    }

    #[test]
    fn test_list_walks_chains() {
        let card = CardImage::open(small_card().build()).unwrap();
        assert!(card.diagnostics().is_empty());
        assert_eq!(card.region(), Region::International);

        let files = card.list_active_files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].entry.filename_str(), "smash");
        assert_eq!(files[0].chain, ChainStatus::Verified(vec![5, 6, 9]));
        assert_eq!(files[1].blocks(), &[7]);
        assert_eq!(card.usage().free_blocks().len(), 59 - 4);
    }

    #[test]
    fn test_export_in_chain_order() {
        let mut builder = small_card();
        builder.write_block(9, b"tail");
        let card = CardImage::open(builder.build()).unwrap();
        let files = card.list_active_files().unwrap();

        let exported = card.export_file(&files[0]).unwrap();
        assert_eq!(exported.blocks, vec![5, 6, 9]);
        assert_eq!(exported.len(), 3 * BLOCK_SIZE);
        assert!(exported.data.starts_with(b"first file"));
        assert!(exported.data[2 * BLOCK_SIZE..].starts_with(b"tail"));
        assert_eq!(exported.sha256.len(), 64);
    }

    #[test]
    fn test_invalid_block_table_gives_unverified_chains() {
        let mut builder = small_card();
        builder.corrupt_block(BLOCK_TABLE_A_BLOCK);
        builder.corrupt_block(crate::types::BLOCK_TABLE_B_BLOCK);
        let card = CardImage::open(builder.build()).unwrap();

        assert_eq!(card.block_table_selection(), SelectionOutcome::NoneValid);
        let files = card.list_active_files().unwrap();
        // contiguous fallback from the first block
        assert_eq!(files[0].chain, ChainStatus::Unverified(vec![5, 6, 7]));
        // block 7 already belongs to slot 0 under the fallback
        assert!(files[1].is_corrupt());
        assert!(card.export_file(&files[1]).is_err());
    }

    #[test]
    fn test_scan_only_without_directory() {
        let mut builder = small_card();
        builder.corrupt_block(crate::types::DIRECTORY_A_BLOCK);
        builder.corrupt_block(DIRECTORY_B_BLOCK);
        let card = CardImage::open(builder.build()).unwrap();

        assert!(card.is_scan_only());
        assert!(matches!(card.list_active_files(), Err(CardError::ScanOnly)));
        assert_eq!(card.usage().free_blocks().len(), 59);
        assert!(card.diagnostics().iter().any(|d| matches!(d, CardError::ScanOnly)));
    }

    #[test]
    fn test_header_checksum_failure_is_recoverable() {
        let mut builder = small_card();
        builder.corrupt_block(HEADER_BLOCK);
        let card = CardImage::open(builder.build()).unwrap();

        assert!(matches!(card.diagnostics()[0], CardError::HeaderChecksum { .. }));
        assert!(card.diagnostics()[0].is_recoverable());
        assert_eq!(card.region(), Region::Unknown);
        assert_eq!(card.list_active_files().unwrap().len(), 2);
    }

    #[test]
    fn test_reselect_refuses_invalid_copy() {
        let mut builder = small_card();
        builder.corrupt_block(DIRECTORY_B_BLOCK);
        let mut card = CardImage::open(builder.build()).unwrap();

        assert!(matches!(
            card.reselect(CopyId::B, CopyId::A),
            Err(CardError::DirectoryTable { copy: CopyId::B, .. })
        ));
        card.reselect(CopyId::A, CopyId::B).unwrap();
        assert_eq!(card.tables().active_block_table_copy(), Some(CopyId::B));
    }

    #[test]
    fn test_japanese_card_region() {
        let builder = CardBuilder::new(64).unwrap().with_encoding(Encoding::ShiftJis);
        let card = CardImage::open(builder.build()).unwrap();
        assert_eq!(card.region(), Region::Japan);
        assert!(card.list_active_files().unwrap().is_empty());
    }

    #[test]
    fn test_export_recovered_entry() {
        let mut builder = small_card();
        builder.write_block(20, b"LOST");
        let card = CardImage::open(builder.build()).unwrap();
        let set = DescriptorSet::new(vec![crate::signatures::FileDescriptor::new(
            "GXXE01",
            "lost",
            crate::matcher::SearchExpression::Pattern(crate::matcher::BytePattern::literal(b"LOST")),
        )])
        .unwrap();

        let outcome = card.scan_for_lost_files(&set, &NoProgress, &CancelToken::new());
        assert_eq!(outcome.entries.len(), 1);
        let exported = card.export_file(&outcome.entries[0]).unwrap();
        assert_eq!(&exported.entry.game_code, b"GXXE");
        assert!(exported.data.starts_with(b"LOST"));
    }
}
