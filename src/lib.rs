//! Memory card image recovery.
//!
//! Opens raw images of 8 KiB-block memory cards, validates the redundant
//! directory and block-allocation tables, lists the files they describe and
//! scans unclaimed blocks for lost files using signature descriptors:
//! - Checksum algorithms per firmware revision (additive, byte sum, CRC-32)
//! - A/B table selection by update counter
//! - Bounded chain walks with per-entry corruption reporting
//! - Pattern and anchored-regex descriptor matching, parallel with rayon
//! - Progress through a sink (closures or tokio::sync::mpsc) and cooperative cancellation

mod bytes;

pub mod builder;
pub mod card;
pub mod checksum;
pub mod cli;
pub mod disk;
pub mod error;
pub mod export;
pub mod format;
pub mod header;
pub mod matcher;
pub mod report;
pub mod scanner;
pub mod signatures;
pub mod tables;
pub mod types;
pub mod usage;

// Re-export commonly used types
pub use builder::CardBuilder;
pub use card::{ActiveFile, CardImage, FileRef};
pub use checksum::{ChecksumAlgorithm, ChecksumValue};
pub use disk::RawImage;
pub use error::{CardError, Result, SizeViolation};
pub use export::ExportedFile;
pub use format::CardFormat;
pub use header::{CardHeader, Encoding, Region};
pub use matcher::{BytePattern, ChecksumCheck, ChecksumField, FieldLocation, LengthField, LengthUnit, SearchExpression};
pub use report::ScanReport;
pub use scanner::{CancelToken, LostFileScanner, NoProgress, ProgressSink, RecoveredFileEntry, ScanOutcome, Validity};
pub use signatures::{DescriptorSet, DescriptorTemplate, FileDescriptor, VariableValue, Variables};
pub use tables::{CopyId, DirectoryEntry, SelectionOutcome, TableSet};
pub use types::{Geometry, Offset, ScanConfig, ScanProgress, ScanStats, ScanStatus, Size, BLOCK_SIZE};
pub use usage::{BlockUsageMap, ChainFault, ChainStatus};
