//! Lost-file scanning over unclaimed blocks.

pub mod lost_files;
pub mod progress;

pub use lost_files::{LengthSource, LostFileScanner, RecoveredFileEntry, ScanOutcome, Validity};
pub use progress::{CancelToken, NoProgress, ProgressSink};
