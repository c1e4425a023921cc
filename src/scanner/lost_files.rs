use std::time::Instant;

use ahash::AHashSet;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::disk::RawImage;
use crate::header::Region;
use crate::matcher::{check_checksum, ChecksumCheck};
use crate::scanner::progress::{CancelToken, ProgressSink};
use crate::signatures::{DescriptorSet, FileDescriptor};
use crate::tables::DirectoryEntry;
use crate::types::{Geometry, ScanConfig, ScanProgress, ScanStats, ScanStatus};
use crate::usage::BlockUsageMap;

/// Confidence in a recovered file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// The file's own checksum field matched
    Verified,
    /// Structural match only
    Heuristic,
}

/// Where a recovered extent length came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSource {
    /// Read from the matched header's length field
    Field,
    /// Descriptor minimum block count
    Minimum,
}

/// A file found in unclaimed blocks, shaped like a directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredFileEntry {
    /// Always true; distinguishes these from table-backed entries in reports
    pub recovered: bool,
    /// Index into the descriptor set the scan was given
    pub descriptor_index: usize,
    pub game_id: String,
    pub filename: String,
    pub start_block: u16,
    pub block_count: u16,
    pub blocks: Vec<u16>,
    pub length_source: LengthSource,
    /// Extent the length source asked for before truncation
    pub expected_blocks: u16,
    pub truncated: bool,
    pub checksum: ChecksumCheck,
    pub validity: Validity,
}

impl RecoveredFileEntry {
    pub fn is_verified(&self) -> bool {
        self.validity == Validity::Verified
    }

    /// Synthesised directory record for the export layer.
    ///
    /// The slot is left at 0 since no table slot backs a recovered file.
    pub fn to_directory_entry(&self) -> DirectoryEntry {
        let id = self.game_id.as_bytes();
        let mut game_code = [0u8; 4];
        let mut maker_code = [0u8; 2];
        for (dst, src) in game_code.iter_mut().zip(id.iter()) {
            *dst = *src;
        }
        for (dst, src) in maker_code.iter_mut().zip(id.iter().skip(4)) {
            *dst = *src;
        }
        DirectoryEntry::new(game_code, maker_code, &self.filename, self.start_block, self.block_count)
            .with_computed_checksum()
    }
}

/// Result of one scan pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// In ascending start-block order
    pub entries: Vec<RecoveredFileEntry>,
    pub status: ScanStatus,
    pub stats: ScanStats,
}

impl ScanOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.status == ScanStatus::Cancelled
    }

    pub fn verified(&self) -> impl Iterator<Item = &RecoveredFileEntry> {
        self.entries.iter().filter(|e| e.validity == Validity::Verified)
    }

    pub fn heuristic(&self) -> impl Iterator<Item = &RecoveredFileEntry> {
        self.entries.iter().filter(|e| e.validity == Validity::Heuristic)
    }
}

/// Signature scan over the blocks no directory entry claims
pub struct LostFileScanner<'a> {
    image: &'a RawImage,
    geometry: Geometry,
    usage: &'a BlockUsageMap,
    descriptors: &'a DescriptorSet,
    config: ScanConfig,
    region: Region,
}

impl<'a> LostFileScanner<'a> {
    pub fn new(
        image: &'a RawImage,
        geometry: Geometry,
        usage: &'a BlockUsageMap,
        descriptors: &'a DescriptorSet,
        config: ScanConfig,
    ) -> Self {
        Self {
            image,
            geometry,
            usage,
            descriptors,
            config,
            region: Region::Unknown,
        }
    }

    /// Card region used by the region filter
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Walk the free blocks in ascending order.
    ///
    /// Cancellation is observed between blocks; whatever was recovered up to
    /// that point is returned with `ScanStatus::Cancelled`.
    pub fn scan<S>(&self, sink: &S, cancel: &CancelToken) -> ScanOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let start_time = Instant::now();
        let region = self.config.region_filter.then_some(self.region);
        let order = self.descriptors.scan_order(region);
        let candidates = self.usage.free_blocks();
        let total = candidates.len();

        info!(
            "scanning {} free blocks with {} of {} descriptors",
            total,
            order.len(),
            self.descriptors.len()
        );

        let mut provisional: AHashSet<u16> = AHashSet::new();
        let mut entries = Vec::new();
        let mut status = ScanStatus::Completed;
        let mut scanned = 0;

        for &block in candidates {
            if cancel.is_cancelled() {
                status = ScanStatus::Cancelled;
                break;
            }

            if !provisional.contains(&block) {
                if let Some(entry) = self.try_block(block, &order, &provisional) {
                    debug!(
                        "block {}: {} ({} blocks, {:?})",
                        block, entry.filename, entry.block_count, entry.validity
                    );
                    provisional.extend(entry.blocks.iter().copied());
                    sink.report(ScanProgress::Recovered(entry.clone()));
                    entries.push(entry);
                }
            }

            scanned += 1;
            let interval = self.config.progress_interval;
            if scanned == total || (interval > 0 && scanned % interval == 0) {
                sink.report(ScanProgress::Blocks { scanned, total });
            }
        }

        let verified = entries.iter().filter(|e| e.is_verified()).count();
        let stats = ScanStats {
            blocks_total: total,
            blocks_scanned: scanned,
            descriptors: order.len(),
            recovered: entries.len(),
            verified,
            heuristic: entries.len() - verified,
            duration_secs: start_time.elapsed().as_secs_f64(),
        };

        info!(
            "scan {:?}: {}/{} blocks, {} recovered ({} verified) in {:.3}s",
            status, scanned, total, stats.recovered, stats.verified, stats.duration_secs
        );
        sink.report(ScanProgress::Finished {
            found: entries.len(),
            status,
        });

        ScanOutcome {
            entries,
            status,
            stats,
        }
    }

    /// First descriptor (in scan order) matching at `block`
    fn match_block(&self, window: &[u8], order: &[usize]) -> Option<usize> {
        let matches = |&index: &usize| self.descriptors.get(index).is_some_and(|d| d.matches(window));

        let position = if order.len() >= self.config.parallel_threshold {
            order.par_iter().position_first(matches)
        } else {
            order.iter().position(matches)
        };
        position.map(|p| order[p])
    }

    fn try_block(&self, block: u16, order: &[usize], provisional: &AHashSet<u16>) -> Option<RecoveredFileEntry> {
        let window = self
            .image
            .blocks_from(block, self.config.match_window_blocks.max(1))
            .ok()?;
        let index = self.match_block(window, order)?;
        let descriptor = self.descriptors.get(index)?;

        let (expected_blocks, length_source) = self.extent_length(descriptor, window);
        let blocks = self.extent(block, expected_blocks, provisional);
        let truncated = blocks.len() < expected_blocks as usize;

        let data = self.image.blocks_from(block, blocks.len()).ok()?;
        let checksum = check_checksum(descriptor.checksum.as_ref(), data);
        let validity = if checksum.is_match() {
            Validity::Verified
        } else {
            Validity::Heuristic
        };

        Some(RecoveredFileEntry {
            recovered: true,
            descriptor_index: index,
            game_id: descriptor.game_id.clone(),
            filename: descriptor.filename.clone(),
            start_block: block,
            block_count: blocks.len() as u16,
            blocks,
            length_source,
            expected_blocks,
            truncated,
            checksum,
            validity,
        })
    }

    fn extent_length(&self, descriptor: &FileDescriptor, header: &[u8]) -> (u16, LengthSource) {
        descriptor
            .length
            .and_then(|field| field.blocks(header, self.geometry.data_block_count()))
            .map(|blocks| (blocks, LengthSource::Field))
            .unwrap_or((descriptor.min_blocks, LengthSource::Minimum))
    }

    /// Contiguous run from `start`, stopping at the card end or at any taken block
    fn extent(&self, start: u16, wanted: u16, provisional: &AHashSet<u16>) -> Vec<u16> {
        let end = (start as u32 + wanted as u32).min(self.geometry.block_count() as u32) as u16;
        (start..end)
            .take_while(|block| !self.usage.is_claimed(*block) && !provisional.contains(block))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{BytePattern, LengthField, LengthUnit, SearchExpression};
    use crate::scanner::progress::NoProgress;
    use crate::signatures::trailing_crc32;
    use crate::types::BLOCK_SIZE;
    use std::sync::Mutex;

    const BLOCKS: u16 = 64;

    fn image_with(plants: &[(u16, &[u8])]) -> RawImage {
        let mut bytes = vec![0u8; BLOCKS as usize * BLOCK_SIZE];
        for (block, data) in plants {
            let start = *block as usize * BLOCK_SIZE;
            bytes[start..start + data.len()].copy_from_slice(data);
        }
        RawImage::from_bytes(bytes)
    }

    fn geometry() -> Geometry {
        Geometry::from_block_count(BLOCKS).unwrap()
    }

    fn descriptor(magic: &[u8], name: &str) -> FileDescriptor {
        FileDescriptor::new("GTSE", name, SearchExpression::Pattern(BytePattern::literal(magic)))
    }

    fn scan(image: &RawImage, usage: &BlockUsageMap, set: &DescriptorSet, config: ScanConfig) -> ScanOutcome {
        LostFileScanner::new(image, geometry(), usage, set, config).scan(&NoProgress, &CancelToken::new())
    }

    /// Two-block file carrying a CRC-32 over everything before its last four bytes
    fn checksummed_file(magic: &[u8]) -> Vec<u8> {
        let mut file = vec![0x5Au8; 2 * BLOCK_SIZE];
        file[..magic.len()].copy_from_slice(magic);
        let crc = crc32fast::hash(&file[..2 * BLOCK_SIZE - 4]);
        file[2 * BLOCK_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        file
    }

    #[test]
    fn test_verified_and_heuristic() {
        let file = checksummed_file(b"SAVE");
        let set = DescriptorSet::new(vec![descriptor(b"SAVE", "save")
            .with_min_blocks(2)
            .with_checksum(trailing_crc32())])
        .unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());

        let image = image_with(&[(20, &file)]);
        let outcome = scan(&image, &usage, &set, ScanConfig::default());
        assert_eq!(outcome.entries.len(), 1);
        let entry = &outcome.entries[0];
        assert!(entry.recovered);
        assert_eq!(entry.start_block, 20);
        assert_eq!(entry.blocks, vec![20, 21]);
        assert_eq!(entry.validity, Validity::Verified);
        assert_eq!(entry.length_source, LengthSource::Minimum);

        let mut damaged = file.clone();
        damaged[100] ^= 0x01;
        let image = image_with(&[(20, &damaged)]);
        let outcome = scan(&image, &usage, &set, ScanConfig::default());
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].validity, Validity::Heuristic);
        assert!(matches!(outcome.entries[0].checksum, ChecksumCheck::Mismatch { .. }));
    }

    #[test]
    fn test_length_field_and_truncation() {
        let mut header = b"LEN!".to_vec();
        header.extend_from_slice(&[0x00, 0x05]);
        let length = LengthField { offset: 4, width: 2, unit: LengthUnit::Blocks, scale: 1 };
        let set = DescriptorSet::new(vec![descriptor(b"LEN!", "len").with_length(length)]).unwrap();

        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        let image = image_with(&[(10, &header), (61, &header)]);
        let outcome = scan(&image, &usage, &set, ScanConfig::default());

        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[0].blocks, vec![10, 11, 12, 13, 14]);
        assert_eq!(outcome.entries[0].length_source, LengthSource::Field);
        assert!(!outcome.entries[0].truncated);

        // card end cuts the second file short
        assert_eq!(outcome.entries[1].blocks, vec![61, 62, 63]);
        assert!(outcome.entries[1].truncated);
        assert_eq!(outcome.entries[1].expected_blocks, 5);
    }

    #[test]
    fn test_provisional_claims_prevent_double_match() {
        let set = DescriptorSet::new(vec![descriptor(b"AAAA", "big").with_min_blocks(3)]).unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        // second header sits inside the first extent
        let image = image_with(&[(30, b"AAAA"), (31, b"AAAA"), (33, b"AAAA")]);
        let outcome = scan(&image, &usage, &set, ScanConfig::default());

        let starts: Vec<u16> = outcome.entries.iter().map(|e| e.start_block).collect();
        assert_eq!(starts, vec![30, 33]);
    }

    #[test]
    fn test_priority_decides_between_descriptors() {
        let low = descriptor(b"HDR", "low");
        let high = descriptor(b"HD", "high").with_priority(10);
        let set = DescriptorSet::new(vec![low, high]).unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        let image = image_with(&[(8, b"HDR")]);

        for threshold in [usize::MAX, 0] {
            let outcome = scan(&image, &usage, &set, ScanConfig::new(true, threshold));
            assert_eq!(outcome.entries.len(), 1);
            assert_eq!(outcome.entries[0].descriptor_index, 1);
            assert_eq!(outcome.entries[0].filename, "high");
        }
    }

    #[test]
    fn test_region_filter_drops_incompatible_descriptors() {
        let set = DescriptorSet::new(vec![FileDescriptor::new(
            "GTSJ",
            "jp",
            SearchExpression::Pattern(BytePattern::literal(b"JPN")),
        )])
        .unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        let image = image_with(&[(9, b"JPN")]);

        let filtered = LostFileScanner::new(&image, geometry(), &usage, &set, ScanConfig::default())
            .with_region(Region::International)
            .scan(&NoProgress, &CancelToken::new());
        assert!(filtered.entries.is_empty());
        assert_eq!(filtered.stats.descriptors, 0);

        let unfiltered = LostFileScanner::new(&image, geometry(), &usage, &set, ScanConfig::new(false, 64))
            .with_region(Region::International)
            .scan(&NoProgress, &CancelToken::new());
        assert_eq!(unfiltered.entries.len(), 1);
    }

    #[test]
    fn test_cancel_stops_within_one_block() {
        let set = DescriptorSet::new(vec![descriptor(b"ZZ", "z")]).unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        let image = image_with(&[(5, b"ZZ"), (40, b"ZZ")]);
        let cancel = CancelToken::new();

        let sink = |p: ScanProgress| {
            if let ScanProgress::Blocks { scanned: 3, .. } = p {
                cancel.cancel();
            }
        };
        let outcome = LostFileScanner::new(&image, geometry(), &usage, &set, ScanConfig::default())
            .scan(&sink, &cancel);

        assert!(outcome.is_cancelled());
        assert_eq!(outcome.stats.blocks_scanned, 3);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].start_block, 5);
    }

    #[test]
    fn test_progress_reports_every_block() {
        let set = DescriptorSet::new(vec![descriptor(b"QQ", "q")]).unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        let image = image_with(&[(7, b"QQ")]);
        let events = Mutex::new(Vec::new());
        let sink = |p: ScanProgress| events.lock().unwrap().push(p);

        LostFileScanner::new(&image, geometry(), &usage, &set, ScanConfig::default())
            .scan(&sink, &CancelToken::new());

        let events = events.into_inner().unwrap();
        let blocks = events
            .iter()
            .filter(|p| matches!(p, ScanProgress::Blocks { .. }))
            .count();
        assert_eq!(blocks, 59);
        assert!(matches!(events.last(), Some(ScanProgress::Finished { found: 1, status: ScanStatus::Completed })));
        assert!(events.iter().any(|p| matches!(p, ScanProgress::Recovered(e) if e.start_block == 7)));
    }

    #[test]
    fn test_progress_interval() {
        let set = DescriptorSet::new(vec![descriptor(b"QQ", "q")]).unwrap();
        let usage = BlockUsageMap::rebuild(None, None, &geometry());
        let image = image_with(&[]);

        let ticks = |interval: usize| {
            let seen = Mutex::new(Vec::new());
            let sink = |p: ScanProgress| {
                if let ScanProgress::Blocks { scanned, .. } = p {
                    seen.lock().unwrap().push(scanned);
                }
            };
            let mut config = ScanConfig::default();
            config.progress_interval = interval;
            LostFileScanner::new(&image, geometry(), &usage, &set, config).scan(&sink, &CancelToken::new());
            seen.into_inner().unwrap()
        };

        // zero still reports the last block
        assert_eq!(ticks(0), vec![59]);
        assert_eq!(ticks(20), vec![20, 40, 59]);
    }

    #[test]
    fn test_to_directory_entry() {
        let entry = RecoveredFileEntry {
            recovered: true,
            descriptor_index: 0,
            game_id: "GALE01".to_string(),
            filename: "SuperSmash".to_string(),
            start_block: 12,
            block_count: 3,
            blocks: vec![12, 13, 14],
            length_source: LengthSource::Minimum,
            expected_blocks: 3,
            truncated: false,
            checksum: ChecksumCheck::NotDefined,
            validity: Validity::Heuristic,
        };
        let dir = entry.to_directory_entry();
        assert_eq!(&dir.game_code, b"GALE");
        assert_eq!(&dir.maker_code, b"01");
        assert_eq!(dir.filename_str(), "SuperSmash");
        assert_eq!(dir.first_block, 12);
        assert_eq!(dir.block_count, 3);
        assert_eq!(dir.stored_checksum, dir.compute_checksum());
    }
}
