//! Checkpoint coordination state and the crash-recovery marker.
//!
//! A checkpoint makes every WAL-recorded change durable in its table file
//! and then truncates the log. The marker file `<wal>.checkpoint` exists
//! only while a checkpoint is running; finding one at startup means an
//! earlier checkpoint did not complete, and the engine must run a forced
//! checkpoint before serving.

use crate::error::CoreResult;
use crate::wal::CheckpointRequest;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Shared checkpoint coordination flags.
///
/// `requested` is set by the WAL size hook and drained by the checkpoint
/// timer; `in_progress` makes checkpoints mutually exclusive without
/// holding the engine lock across the whole run.
#[derive(Debug, Default)]
pub(crate) struct CheckpointState {
    in_progress: AtomicBool,
    requested: AtomicBool,
    last_run_ms: AtomicU64,
}

impl CheckpointState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attempts to start a checkpoint. Returns false when one is already
    /// running, or when not forced and the interval has not elapsed.
    pub(crate) fn try_begin(&self, force: bool, interval: Duration, now_ms: u64) -> bool {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if !force {
            let elapsed = now_ms.saturating_sub(self.last_run_ms.load(Ordering::SeqCst));
            let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            if elapsed < interval_ms {
                self.in_progress.store(false, Ordering::SeqCst);
                return false;
            }
        }
        true
    }

    /// Records a successful run and releases the in-progress marker.
    pub(crate) fn finish(&self, now_ms: u64) {
        self.last_run_ms.store(now_ms, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
    }

    /// Releases the in-progress marker after a failed run.
    pub(crate) fn abort(&self) {
        self.in_progress.store(false, Ordering::SeqCst);
    }

    /// Drains the WAL-requested flag.
    pub(crate) fn take_requested(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl CheckpointRequest for CheckpointState {
    fn checkpoint_requested(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

/// Writes the recovery marker containing the checkpoint start timestamp.
pub(crate) fn write_marker(path: &Path, start_ms: u64) -> CoreResult<()> {
    fs::write(path, format!("{start_ms}\n"))?;
    Ok(())
}

/// Removes the recovery marker if present.
pub(crate) fn remove_marker(path: &Path) -> CoreResult<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Returns true if a recovery marker is present.
pub(crate) fn marker_exists(path: &Path) -> bool {
    path.exists()
}
