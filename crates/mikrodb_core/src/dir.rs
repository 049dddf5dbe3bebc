//! Database directory management.
//!
//! This module handles the file system layout for MikroDB:
//!
//! ```text
//! <db_path>/
//! ├─ LOCK                  # Advisory lock for single-writer
//! ├─ wal.log               # Write-ahead log (name configurable)
//! ├─ wal.log.checkpoint    # Transient crash-recovery marker
//! ├─ <table>               # One binary file per table
//! ├─ <table>_dump.json     # Operator dumps
//! └─ <table>.tmp.<ts>.<r>  # Short-lived atomic-write temp files
//! ```
//!
//! The LOCK file ensures only one process writes to the database at a time.
//! Table files are only ever replaced atomically: write temp, sync, rename,
//! fsync the directory.

use crate::error::{CoreError, CoreResult};
use crate::types::validate_table_name;
use fs2::FileExt;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// Manages the database directory structure and file locking.
///
/// Only one `DatabaseDir` instance can exist per directory at a time.
#[derive(Debug)]
pub struct DatabaseDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and acquires its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another process holds the
    /// lock, or an I/O error if the directory cannot be created.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(CoreError::validation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of a table file, validating the name first.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unusable table names.
    pub fn table_path(&self, table: &str) -> CoreResult<PathBuf> {
        validate_table_name(table)?;
        Ok(self.path.join(table))
    }

    /// Returns the path of the WAL file.
    #[must_use]
    pub fn wal_path(&self, wal_file_name: &str) -> PathBuf {
        self.path.join(wal_file_name)
    }

    /// Returns the path of the checkpoint recovery marker.
    #[must_use]
    pub fn checkpoint_marker_path(&self, wal_file_name: &str) -> PathBuf {
        self.path.join(format!("{wal_file_name}.checkpoint"))
    }

    /// Returns the path of a table's operator dump.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unusable table names.
    pub fn dump_path(&self, table: &str) -> CoreResult<PathBuf> {
        validate_table_name(table)?;
        Ok(self.path.join(format!("{table}_dump.json")))
    }

    /// Atomically replaces `target` with `data`.
    ///
    /// Writes to a uniquely named sibling temp file, syncs it, renames it
    /// over the target, and fsyncs the directory. The unique suffix allows
    /// concurrent persists in the same directory. On failure the temp file
    /// is removed and the error surfaces.
    pub fn atomic_replace(&self, target: &Path, data: &[u8]) -> CoreResult<()> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::validation("target has no file name"))?;
        let suffix: u32 = rand::thread_rng().gen();
        let temp_path = self.path.join(format!(
            "{file_name}.tmp.{}.{suffix:08x}",
            crate::types::now_millis()
        ));

        let result = (|| -> CoreResult<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, target)?;
            self.sync_directory()?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    /// Syncs the database directory so renames and deletions are durable.
    ///
    /// On Windows the NTFS journal covers metadata durability and directory
    /// fsync is not supported, so this is a no-op there.
    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}
