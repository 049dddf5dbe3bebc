//! Buffered WAL appender and replay.

use crate::error::CoreResult;
use crate::wal::entry::WalEntry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use tracing::warn;

/// Receiver of "the WAL grew past its checkpoint threshold" notifications.
///
/// The WAL holds the receiver weakly; implementations should only set a
/// flag, the flush path never blocks on checkpoint work.
pub trait CheckpointRequest: Send + Sync {
    /// Called after a flush left the on-disk WAL above the size threshold.
    fn checkpoint_requested(&self);
}

/// Flush triggers and the checkpoint threshold.
#[derive(Debug, Clone)]
pub struct WalLimits {
    /// Flush when this many entries are buffered.
    pub max_buffer_entries: usize,
    /// Flush when the buffered lines reach this many bytes.
    pub max_buffer_size: usize,
    /// Request a checkpoint when the file exceeds this size after a flush.
    pub max_size_before_checkpoint: u64,
}

#[derive(Default)]
struct WalBuffer {
    lines: Vec<String>,
    bytes: usize,
}

/// Manages the append-only WAL file.
///
/// Entries accumulate in an in-memory buffer and reach the file when an
/// entry-count or byte-size trigger fires, on the periodic flush timer, or
/// on an explicit flush. Replay keeps a per-table cursor so repeated calls
/// for the same table deliver only new entries.
pub struct WalManager {
    path: PathBuf,
    limits: WalLimits,
    /// Serializes file writes so flushed batches land in append order.
    file: Mutex<File>,
    buffer: Mutex<WalBuffer>,
    /// Per-table count of file lines already scanned during replay.
    cursors: Mutex<HashMap<String, usize>>,
    checkpoint_hook: Mutex<Option<Weak<dyn CheckpointRequest>>>,
}

impl WalManager {
    /// Opens (or creates empty) the WAL file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, limits: WalLimits) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            limits,
            file: Mutex::new(file),
            buffer: Mutex::new(WalBuffer::default()),
            cursors: Mutex::new(HashMap::new()),
            checkpoint_hook: Mutex::new(None),
        })
    }

    /// Wires the checkpoint-request hook. Held weakly to avoid an ownership
    /// cycle with the engine.
    pub fn set_checkpoint_hook(&self, hook: Weak<dyn CheckpointRequest>) {
        *self.checkpoint_hook.lock() = Some(hook);
    }

    /// Appends an entry to the buffer, flushing if a trigger fires.
    ///
    /// # Errors
    ///
    /// Propagates flush I/O errors; the buffered entries are restored
    /// before the error surfaces.
    pub fn append(&self, entry: &WalEntry) -> CoreResult<()> {
        let line = entry.format_line();
        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.bytes += line.len() + 1;
            buffer.lines.push(line);
            buffer.lines.len() >= self.limits.max_buffer_entries
                || buffer.bytes >= self.limits.max_buffer_size
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes the buffer to the file.
    ///
    /// On an I/O failure the unwritten lines are re-prepended ahead of any
    /// entries appended in the meantime, and the error propagates. After a
    /// successful flush the checkpoint hook fires if the file outgrew its
    /// threshold.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on append failure.
    pub fn flush(&self) -> CoreResult<()> {
        // Take the file lock first so concurrent flushes write in order.
        let file = self.file.lock();

        let taken = {
            let mut buffer = self.buffer.lock();
            if buffer.lines.is_empty() {
                return Ok(());
            }
            buffer.bytes = 0;
            std::mem::take(&mut buffer.lines)
        };

        let mut chunk = String::with_capacity(taken.iter().map(|l| l.len() + 1).sum());
        for line in &taken {
            chunk.push_str(line);
            chunk.push('\n');
        }

        let result = (|| -> CoreResult<()> {
            let mut f = &*file;
            f.write_all(chunk.as_bytes())?;
            f.sync_data()?;
            Ok(())
        })();

        if let Err(err) = result {
            let mut buffer = self.buffer.lock();
            let restored_bytes: usize = taken.iter().map(|l| l.len() + 1).sum();
            buffer.bytes += restored_bytes;
            let newer = std::mem::take(&mut buffer.lines);
            buffer.lines = taken;
            buffer.lines.extend(newer);
            return Err(err);
        }

        let size = file.metadata()?.len();
        drop(file);

        if size > self.limits.max_size_before_checkpoint {
            let hook = self.checkpoint_hook.lock().clone();
            if let Some(hook) = hook.and_then(|weak| weak.upgrade()) {
                hook.checkpoint_requested();
            }
        }
        Ok(())
    }

    /// Returns the on-disk size of the WAL file.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }

    /// Returns the number of buffered, not yet flushed entries.
    #[must_use]
    pub fn buffered_entries(&self) -> usize {
        self.buffer.lock().lines.len()
    }

    /// Replays entries for `table` that the cursor has not yet delivered.
    ///
    /// Malformed lines are logged and skipped; entries whose expiration has
    /// passed at `now_ms` are skipped. The cursor advances to the end of
    /// the file regardless.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn replay_table<F>(&self, table: &str, now_ms: u64, mut apply: F) -> CoreResult<()>
    where
        F: FnMut(WalEntry),
    {
        let contents = {
            let _file = self.file.lock();
            std::fs::read_to_string(&self.path)?
        };

        let mut cursors = self.cursors.lock();
        let start = cursors.get(table).copied().unwrap_or(0);

        let mut total = 0usize;
        for (index, line) in contents.lines().enumerate() {
            total = index + 1;
            if index < start || line.is_empty() {
                continue;
            }
            let entry = match WalEntry::parse_line(line) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(line = index + 1, %err, "skipping malformed WAL line");
                    continue;
                }
            };
            if entry.table != table {
                continue;
            }
            if entry.is_expired(now_ms) {
                continue;
            }
            apply(entry);
        }

        cursors.insert(table.to_string(), total);
        Ok(())
    }

    /// Returns the distinct tables referenced by the on-disk WAL, in first
    /// appearance order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn referenced_tables(&self) -> CoreResult<Vec<String>> {
        let contents = {
            let _file = self.file.lock();
            std::fs::read_to_string(&self.path)?
        };

        let mut tables = Vec::new();
        for line in contents.lines().filter(|l| !l.is_empty()) {
            if let Ok(entry) = WalEntry::parse_line(line) {
                if !tables.contains(&entry.table) {
                    tables.push(entry.table);
                }
            }
        }
        Ok(tables)
    }

    /// Truncates the WAL to empty and resets all replay cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails.
    pub fn truncate(&self) -> CoreResult<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        file.sync_all()?;
        self.cursors.lock().clear();
        Ok(())
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("path", &self.path)
            .field("buffered_entries", &self.buffered_entries())
            .finish_non_exhaustive()
    }
}
