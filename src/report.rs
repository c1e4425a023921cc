//! JSON report of an opened card and, optionally, a lost-file scan.

use std::fs;
use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::card::CardImage;
use crate::error::{CardError, Result};
use crate::header::Region;
use crate::scanner::{RecoveredFileEntry, ScanOutcome};
use crate::tables::{CopyId, SelectionOutcome};
use crate::types::{ScanStats, ScanStatus};
use crate::usage::ChainStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Local time the report was generated
    pub timestamp: String,
    pub tool_name: String,
    pub version: String,
    pub image_path: String,
}

impl ReportMetadata {
    pub fn new(image_path: &str) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            tool_name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            image_path: image_path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSummary {
    pub size_bytes: u64,
    pub block_count: u16,
    pub size_mbits: u16,
    pub region: Region,
    pub directory_selection: SelectionOutcome,
    pub block_table_selection: SelectionOutcome,
    pub active_directory: Option<CopyId>,
    pub active_block_table: Option<CopyId>,
    pub scan_only: bool,
    pub claimed_blocks: usize,
    pub free_blocks: usize,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveFileSummary {
    pub slot: usize,
    pub game_code: String,
    pub maker_code: String,
    pub filename: String,
    pub first_block: u16,
    pub block_count: u16,
    pub modified: Option<String>,
    /// `verified`, `unverified` or the corruption reason
    pub chain: String,
    pub blocks: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub status: ScanStatus,
    pub stats: ScanStats,
    pub recovered: Vec<RecoveredFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub metadata: ReportMetadata,
    pub card: CardSummary,
    pub active_files: Vec<ActiveFileSummary>,
    pub scan: Option<ScanSummary>,
}

impl ScanReport {
    pub fn new(card: &CardImage, image_path: &str, outcome: Option<&ScanOutcome>) -> Self {
        let geometry = card.geometry();
        let tables = card.tables();

        let summary = CardSummary {
            size_bytes: geometry.image_size(),
            block_count: geometry.block_count(),
            size_mbits: geometry.size_mbits(),
            region: card.region(),
            directory_selection: tables.directory_selection(),
            block_table_selection: tables.block_table_selection(),
            active_directory: tables.active_directory_copy(),
            active_block_table: tables.active_block_table_copy(),
            scan_only: card.is_scan_only(),
            claimed_blocks: card.usage().claimed_count(),
            free_blocks: card.usage().free_blocks().len(),
            diagnostics: card.diagnostics().iter().map(|d| d.to_string()).collect(),
        };

        let active_files = card
            .list_active_files()
            .unwrap_or_default()
            .into_iter()
            .map(|file| ActiveFileSummary {
                slot: file.entry.slot,
                game_code: file.entry.game_code_str(),
                maker_code: file.entry.maker_code_str(),
                filename: file.entry.filename_str(),
                first_block: file.entry.first_block,
                block_count: file.entry.block_count,
                modified: file
                    .entry
                    .modified_at()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
                chain: match &file.chain {
                    ChainStatus::Verified(_) => "verified".to_string(),
                    ChainStatus::Unverified(_) => "unverified".to_string(),
                    ChainStatus::Corrupt(fault) => format!("corrupt: {}", fault),
                },
                blocks: file.blocks().to_vec(),
            })
            .collect();

        let scan = outcome.map(|outcome| ScanSummary {
            status: outcome.status,
            stats: outcome.stats.clone(),
            recovered: outcome.entries.clone(),
        });

        Self {
            metadata: ReportMetadata::new(image_path),
            card: summary,
            active_files,
            scan,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CardError::Parse(format!("report serialization: {}", e)))
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
