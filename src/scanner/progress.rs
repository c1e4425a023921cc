use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{error::TrySendError, Sender, UnboundedSender};

use crate::types::ScanProgress;

/// Cooperative cancellation flag shared between a scan and its owner.
///
/// Clones share the same flag. The scanner checks it once per block.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can drive another scan
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Receiver of scan progress.
///
/// Block ticks may be dropped by a sink that cannot keep up; recovered files
/// and the final `Finished` message must be delivered.
pub trait ProgressSink: Sync {
    fn report(&self, progress: ScanProgress);
}

/// Discards every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: ScanProgress) {}
}

impl<F> ProgressSink for F
where
    F: Fn(ScanProgress) + Sync,
{
    fn report(&self, progress: ScanProgress) {
        self(progress)
    }
}

/// Bounded channel. Block ticks are dropped while the channel is full;
/// recovered files and `Finished` wait for room, so the scan must run on a
/// blocking thread (`spawn_blocking` or `std::thread`), never on an async worker.
impl ProgressSink for Sender<ScanProgress> {
    fn report(&self, progress: ScanProgress) {
        if let ScanProgress::Blocks { .. } = progress {
            match self.try_send(progress) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => log::trace!("progress channel full, block tick dropped"),
            }
            return;
        }
        // fails only when the receiver is gone
        let _ = self.blocking_send(progress);
    }
}

impl ProgressSink for UnboundedSender<ScanProgress> {
    fn report(&self, progress: ScanProgress) {
        let _ = self.send(progress);
    }
}
