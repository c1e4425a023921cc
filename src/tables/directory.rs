use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::bytes::{read_u16_be, read_u32_be, read_u8, write_u16_be, write_u32_be};
use crate::checksum::{self, ChecksumAlgorithm, ChecksumValue};
use crate::format::ENTRY_CHECKSUM;
use crate::header::Region;
use crate::tables::{CopyId, EntryFault, TableFault};
use crate::types::{Geometry, BLOCK_SIZE};

/// Directory entry size in bytes
pub const DIRECTORY_ENTRY_SIZE: usize = 64;

/// Entry slots per directory block
pub const DIRECTORY_CAPACITY: usize = 127;

const DIR_UPDATE_COUNTER: usize = 0x1FFA;
const DIR_CHECKSUM: usize = 0x1FFC;

/// Entry field offsets
const DE_GAME_CODE: usize = 0x00;
const DE_MAKER_CODE: usize = 0x04;
const DE_RESERVED: usize = 0x06;
const DE_BANNER_FORMAT: usize = 0x07;
const DE_FILENAME: usize = 0x08;
const DE_MODIFIED: usize = 0x28;
const DE_IMAGE_OFFSET: usize = 0x2C;
const DE_ICON_FORMAT: usize = 0x30;
const DE_ANIM_SPEED: usize = 0x32;
const DE_PERMISSIONS: usize = 0x34;
const DE_COPY_COUNTER: usize = 0x35;
const DE_FIRST_BLOCK: usize = 0x36;
const DE_BLOCK_COUNT: usize = 0x38;
const DE_CHECKSUM: usize = 0x3A;
const DE_COMMENT_OFFSET: usize = 0x3C;

const FILENAME_LEN: usize = 32;

/// Stored entry checksum value meaning "no checksum recorded"
pub const ENTRY_CHECKSUM_ABSENT: u16 = 0xFFFF;

/// Permission bits of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Permissions(pub u8);

impl Permissions {
    pub const PUBLIC: u8 = 0x04;
    pub const NO_COPY: u8 = 0x08;
    pub const NO_MOVE: u8 = 0x10;
    const DEFINED: u8 = Self::PUBLIC | Self::NO_COPY | Self::NO_MOVE;

    /// True when no bit outside the defined set is present
    pub fn is_defined(&self) -> bool {
        self.0 & !Self::DEFINED == 0
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::PUBLIC) {
            parts.push("public");
        }
        if self.contains(Self::NO_COPY) {
            parts.push("no-copy");
        }
        if self.contains(Self::NO_MOVE) {
            parts.push("no-move");
        }
        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// One file record of a directory table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub slot: usize,
    pub game_code: [u8; 4],
    pub maker_code: [u8; 2],
    pub banner_format: u8,
    pub filename: [u8; FILENAME_LEN],
    /// Seconds since 2000-01-01 00:00:00
    pub modified: u32,
    pub image_offset: u32,
    pub icon_format: u16,
    pub anim_speed: u16,
    pub permissions: Permissions,
    pub copy_counter: u8,
    pub first_block: u16,
    pub block_count: u16,
    pub stored_checksum: u16,
    pub comment_offset: u32,
}

impl DirectoryEntry {
    /// Blank entry with the given identity; checksum is left absent
    pub fn new(game_code: [u8; 4], maker_code: [u8; 2], filename: &str, first_block: u16, block_count: u16) -> Self {
        let mut name = [0u8; FILENAME_LEN];
        let bytes = filename.as_bytes();
        let len = bytes.len().min(FILENAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);

        Self {
            slot: 0,
            game_code,
            maker_code,
            banner_format: 0,
            filename: name,
            modified: 0,
            image_offset: 0,
            icon_format: 0,
            anim_speed: 0,
            permissions: Permissions(Permissions::PUBLIC),
            copy_counter: 0,
            first_block,
            block_count,
            stored_checksum: ENTRY_CHECKSUM_ABSENT,
            comment_offset: 0,
        }
    }

    /// An unused slot has an all-0xFF game code
    pub fn is_empty_slot(raw: &[u8]) -> bool {
        raw.get(DE_GAME_CODE..DE_GAME_CODE + 4)
            .map_or(true, |code| code.iter().all(|&b| b == 0xFF))
    }

    /// Decode a 64-byte slot; `None` for empty or truncated slots
    pub fn parse(slot: usize, raw: &[u8]) -> Option<Self> {
        if raw.len() < DIRECTORY_ENTRY_SIZE || Self::is_empty_slot(raw) {
            return None;
        }

        let mut game_code = [0u8; 4];
        game_code.copy_from_slice(&raw[DE_GAME_CODE..DE_GAME_CODE + 4]);
        let mut maker_code = [0u8; 2];
        maker_code.copy_from_slice(&raw[DE_MAKER_CODE..DE_MAKER_CODE + 2]);
        let mut filename = [0u8; FILENAME_LEN];
        filename.copy_from_slice(&raw[DE_FILENAME..DE_FILENAME + FILENAME_LEN]);

        Some(Self {
            slot,
            game_code,
            maker_code,
            banner_format: read_u8(raw, DE_BANNER_FORMAT)?,
            filename,
            modified: read_u32_be(raw, DE_MODIFIED)?,
            image_offset: read_u32_be(raw, DE_IMAGE_OFFSET)?,
            icon_format: read_u16_be(raw, DE_ICON_FORMAT)?,
            anim_speed: read_u16_be(raw, DE_ANIM_SPEED)?,
            permissions: Permissions(read_u8(raw, DE_PERMISSIONS)?),
            copy_counter: read_u8(raw, DE_COPY_COUNTER)?,
            first_block: read_u16_be(raw, DE_FIRST_BLOCK)?,
            block_count: read_u16_be(raw, DE_BLOCK_COUNT)?,
            stored_checksum: read_u16_be(raw, DE_CHECKSUM)?,
            comment_offset: read_u32_be(raw, DE_COMMENT_OFFSET)?,
        })
    }

    /// Encode into the 64-byte on-disk record
    pub fn to_bytes(&self) -> [u8; DIRECTORY_ENTRY_SIZE] {
        let mut raw = [0u8; DIRECTORY_ENTRY_SIZE];
        raw[DE_GAME_CODE..DE_GAME_CODE + 4].copy_from_slice(&self.game_code);
        raw[DE_MAKER_CODE..DE_MAKER_CODE + 2].copy_from_slice(&self.maker_code);
        raw[DE_RESERVED] = 0xFF;
        raw[DE_BANNER_FORMAT] = self.banner_format;
        raw[DE_FILENAME..DE_FILENAME + FILENAME_LEN].copy_from_slice(&self.filename);
        write_u32_be(&mut raw, DE_MODIFIED, self.modified);
        write_u32_be(&mut raw, DE_IMAGE_OFFSET, self.image_offset);
        write_u16_be(&mut raw, DE_ICON_FORMAT, self.icon_format);
        write_u16_be(&mut raw, DE_ANIM_SPEED, self.anim_speed);
        raw[DE_PERMISSIONS] = self.permissions.0;
        raw[DE_COPY_COUNTER] = self.copy_counter;
        write_u16_be(&mut raw, DE_FIRST_BLOCK, self.first_block);
        write_u16_be(&mut raw, DE_BLOCK_COUNT, self.block_count);
        write_u16_be(&mut raw, DE_CHECKSUM, self.stored_checksum);
        write_u32_be(&mut raw, DE_COMMENT_OFFSET, self.comment_offset);
        raw
    }

    /// Checksum of the fields preceding the checksum slot
    pub fn compute_checksum(&self) -> u16 {
        let raw = self.to_bytes();
        checksum::compute(ENTRY_CHECKSUM, &raw[..DE_CHECKSUM]).as_u32() as u16
    }

    /// Store the freshly computed checksum
    pub fn with_computed_checksum(mut self) -> Self {
        self.stored_checksum = self.compute_checksum();
        self
    }

    /// Field-range invariants of a used slot
    pub fn validate(&self, geometry: &Geometry) -> Result<(), EntryFault> {
        if !geometry.is_data_block(self.first_block) {
            return Err(EntryFault::FirstBlockOutOfRange(self.first_block));
        }
        if self.block_count == 0 || self.block_count > geometry.data_block_count() {
            return Err(EntryFault::BadBlockCount(self.block_count));
        }
        if !self.permissions.is_defined() {
            return Err(EntryFault::UndefinedPermissions(self.permissions.0));
        }
        if self.stored_checksum != ENTRY_CHECKSUM_ABSENT {
            let computed = self.compute_checksum();
            if computed != self.stored_checksum {
                return Err(EntryFault::ChecksumMismatch {
                    stored: self.stored_checksum,
                    computed,
                });
            }
        }
        Ok(())
    }

    pub fn game_code_str(&self) -> String {
        String::from_utf8_lossy(&self.game_code).to_string()
    }

    pub fn maker_code_str(&self) -> String {
        String::from_utf8_lossy(&self.maker_code).to_string()
    }

    /// Internal filename up to the first NUL
    pub fn filename_str(&self) -> String {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        String::from_utf8_lossy(&self.filename[..end]).to_string()
    }

    pub fn region(&self) -> Region {
        Region::from_game_code(&self.game_code)
    }

    pub fn modified_at(&self) -> Option<NaiveDateTime> {
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1)?.and_hms_opt(0, 0, 0)?;
        epoch.checked_add_signed(Duration::seconds(self.modified as i64))
    }

    /// Size in bytes the entry declares
    pub fn byte_len(&self) -> u64 {
        self.block_count as u64 * BLOCK_SIZE as u64
    }
}

/// One parsed copy of the directory table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTable {
    pub copy: CopyId,
    pub update_counter: u16,
    pub stored_checksum: ChecksumValue,
    /// Used slots in slot order
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryTable {
    /// Parse and validate one directory block.
    ///
    /// The copy is rejected as a whole when its checksum fails or any used
    /// slot breaks a field-range invariant.
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
            checksum::read_stored(algorithm, &block[DIR_CHECKSUM..]).ok_or(TableFault::Truncated)?;
        let computed = checksum::compute(algorithm, &block[..DIR_CHECKSUM]);
        if computed != stored_checksum {
            return Err(TableFault::ChecksumMismatch {
                stored: stored_checksum.as_u32(),
                computed: computed.as_u32(),
            });
        }

        let update_counter = read_u16_be(block, DIR_UPDATE_COUNTER).ok_or(TableFault::Truncated)?;

        let mut entries = Vec::new();
        for slot in 0..DIRECTORY_CAPACITY {
            let start = slot * DIRECTORY_ENTRY_SIZE;
            let raw = &block[start..start + DIRECTORY_ENTRY_SIZE];
            if let Some(entry) = DirectoryEntry::parse(slot, raw) {
                entry
                    .validate(geometry)
                    .map_err(|fault| TableFault::InvalidEntry { slot, fault })?;
                entries.push(entry);
            }
        }

        Ok(Self {
            copy,
            update_counter,
            stored_checksum,
            entries,
        })
    }

    pub fn entry(&self, slot: usize) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.slot == slot)
    }

    /// Serialize a directory block. Unused slots are filled with 0xFF.
    pub fn encode(entries: &[DirectoryEntry], update_counter: u16, algorithm: ChecksumAlgorithm) -> Vec<u8> {
        let mut block = vec![0xFFu8; BLOCK_SIZE];
        for entry in entries {
            if entry.slot >= DIRECTORY_CAPACITY {
                continue;
            }
            let start = entry.slot * DIRECTORY_ENTRY_SIZE;
            block[start..start + DIRECTORY_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }
        write_u16_be(&mut block, DIR_UPDATE_COUNTER, update_counter);
        let sum = checksum::compute(algorithm, &block[..DIR_CHECKSUM]);
        checksum::write_stored(algorithm, sum, &mut block[DIR_CHECKSUM..]);
        block
    }
}
