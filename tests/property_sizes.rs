//! Property tests for size validation, copy selection and chain walking.

use std::collections::HashSet;

use proptest::prelude::*;

use memcard_recovery::tables::{select, BlockLink};
use memcard_recovery::types::{FIRST_DATA_BLOCK, MAX_IMAGE_SIZE, MIN_IMAGE_SIZE};
use memcard_recovery::{CardBuilder, CardError, CardImage, CopyId, DirectoryEntry, Geometry, SelectionOutcome};

const SMALL_CARD: u16 = 64;

fn link_strategy() -> impl Strategy<Value = BlockLink> {
    prop_oneof![
        Just(BlockLink::Free),
        Just(BlockLink::EndOfChain),
        (FIRST_DATA_BLOCK..SMALL_CARD).prop_map(BlockLink::Next),
    ]
}

proptest! {
    #[test]
    fn prop_image_size_accepted_iff_power_of_two_in_bounds(size in 0u64..(MAX_IMAGE_SIZE * 4)) {
        let expected = size.is_power_of_two() && (MIN_IMAGE_SIZE..=MAX_IMAGE_SIZE).contains(&size);
        match Geometry::from_image_size(size) {
            Ok(geometry) => {
                prop_assert!(expected);
                prop_assert_eq!(geometry.image_size(), size);
            }
            Err(e) => {
                prop_assert!(!expected);
                let is_size_error = matches!(e, CardError::ImageSize { .. });
                prop_assert!(is_size_error);
            }
        }
    }

    #[test]
    fn prop_power_of_two_sizes(shift in 0u32..40) {
        let size = 1u64 << shift;
        let accepted = Geometry::from_image_size(size).is_ok();
        prop_assert_eq!(accepted, (MIN_IMAGE_SIZE..=MAX_IMAGE_SIZE).contains(&size));
    }

    #[test]
    fn prop_select_prefers_strictly_newer_b(a in any::<u16>(), b in any::<u16>()) {
        let expected = if b > a { CopyId::B } else { CopyId::A };
        prop_assert_eq!(select(Some(a), Some(b)), SelectionOutcome::BothValid(expected));
        prop_assert_eq!(select(Some(a), None), SelectionOutcome::SingleValid(CopyId::A));
        prop_assert_eq!(select(None, Some(b)), SelectionOutcome::SingleValid(CopyId::B));
    }

    #[test]
    fn prop_random_link_tables_give_disjoint_chains(
        links in proptest::collection::vec(link_strategy(), (SMALL_CARD - FIRST_DATA_BLOCK) as usize),
        entries in proptest::collection::vec((FIRST_DATA_BLOCK..SMALL_CARD, 1u16..12), 0..8),
    ) {
        let mut builder = CardBuilder::new(SMALL_CARD).unwrap();
        for (i, link) in links.iter().enumerate() {
            builder.set_link(FIRST_DATA_BLOCK + i as u16, *link);
        }
        for (i, (first, count)) in entries.iter().enumerate() {
            let name = format!("file{}", i);
            builder.add_entry(DirectoryEntry::new(*b"GALE", *b"01", &name, *first, *count)).unwrap();
        }

        let card = CardImage::open(builder.build()).unwrap();
        let files = card.list_active_files().unwrap();
        prop_assert_eq!(files.len(), entries.len());

        let mut claimed = HashSet::new();
        for file in &files {
            if file.is_corrupt() {
                // corrupt entries claim nothing
                for block in file.blocks() {
                    prop_assert_ne!(card.usage().owner(*block), Some(file.entry.slot));
                }
                continue;
            }
            let blocks = file.blocks();
            prop_assert_eq!(blocks.len(), file.entry.block_count as usize);
            for block in blocks {
                prop_assert!(claimed.insert(*block), "block {} claimed twice", block);
                prop_assert_eq!(card.usage().owner(*block), Some(file.entry.slot));
            }
        }

        let free: HashSet<u16> = card.usage().free_blocks().iter().copied().collect();
        prop_assert!(free.is_disjoint(&claimed));
        prop_assert_eq!(free.len() + claimed.len(), (SMALL_CARD - FIRST_DATA_BLOCK) as usize);
    }

    #[test]
    fn prop_builder_cards_open_at_every_size(shift in 0u32..6, files in 0usize..4) {
        let block_count = 64u16 << shift;
        let mut builder = CardBuilder::new(block_count).unwrap();
        for i in 0..files {
            let block = FIRST_DATA_BLOCK + i as u16;
            builder.add_file(*b"GALE", *b"01", &format!("save{}", i), &[block], b"data").unwrap();
        }

        let card = CardImage::open(builder.build()).unwrap();
        prop_assert_eq!(card.geometry().block_count(), block_count);
        prop_assert!(card.diagnostics().is_empty());
        prop_assert_eq!(card.list_active_files().unwrap().len(), files);
        prop_assert_eq!(
            card.usage().free_blocks().len(),
            (block_count - FIRST_DATA_BLOCK) as usize - files
        );
    }
}
