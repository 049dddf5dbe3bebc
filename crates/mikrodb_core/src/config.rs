//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding table files and the WAL.
    pub database_dir: PathBuf,

    /// File name of the write-ahead log inside the database directory.
    pub wal_file_name: String,

    /// Interval of the background WAL flush and checkpoint timers.
    /// `Duration::ZERO` disables both timers.
    pub wal_interval: Duration,

    /// Password for envelope encryption of table files. `None` stores
    /// table files in plaintext.
    pub encryption_key: Option<String>,

    /// Pending writes accumulated before the write buffer is processed.
    pub max_write_ops_before_flush: usize,

    /// Maximum number of tables resident in memory.
    pub cache_limit: usize,

    /// WAL buffer flush trigger: buffered entry count.
    pub max_wal_buffer_entries: usize,

    /// WAL buffer flush trigger: buffered byte size.
    pub max_wal_buffer_size: usize,

    /// On-disk WAL size past which a checkpoint is requested.
    pub max_wal_size_before_checkpoint: u64,

    /// Emit verbose per-operation logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("mikrodb"),
            wal_file_name: "wal.log".to_string(),
            wal_interval: Duration::from_secs(2),
            encryption_key: None,
            max_write_ops_before_flush: 100,
            cache_limit: 50,
            max_wal_buffer_entries: 100,
            max_wal_buffer_size: 10 * 1024,
            max_wal_size_before_checkpoint: 4 * 1024 * 1024,
            debug: false,
        }
    }
}

impl Config {
    /// Creates a configuration rooted at the given directory.
    #[must_use]
    pub fn new(database_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_dir: database_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the WAL file name.
    #[must_use]
    pub fn wal_file_name(mut self, name: impl Into<String>) -> Self {
        self.wal_file_name = name.into();
        self
    }

    /// Sets the background timer interval. Zero disables the timers.
    #[must_use]
    pub const fn wal_interval(mut self, interval: Duration) -> Self {
        self.wal_interval = interval;
        self
    }

    /// Enables envelope encryption with the given password.
    #[must_use]
    pub fn encryption_key(mut self, password: impl Into<String>) -> Self {
        self.encryption_key = Some(password.into());
        self
    }

    /// Sets the write-buffer processing threshold.
    #[must_use]
    pub const fn max_write_ops_before_flush(mut self, ops: usize) -> Self {
        self.max_write_ops_before_flush = ops;
        self
    }

    /// Sets the resident-table limit.
    #[must_use]
    pub const fn cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    /// Sets the WAL buffer entry-count flush trigger.
    #[must_use]
    pub const fn max_wal_buffer_entries(mut self, entries: usize) -> Self {
        self.max_wal_buffer_entries = entries;
        self
    }

    /// Sets the WAL buffer byte-size flush trigger.
    #[must_use]
    pub const fn max_wal_buffer_size(mut self, bytes: usize) -> Self {
        self.max_wal_buffer_size = bytes;
        self
    }

    /// Sets the WAL size past which a checkpoint is requested.
    #[must_use]
    pub const fn max_wal_size_before_checkpoint(mut self, bytes: u64) -> Self {
        self.max_wal_size_before_checkpoint = bytes;
        self
    }

    /// Toggles verbose logging.
    #[must_use]
    pub const fn debug(mut self, value: bool) -> Self {
        self.debug = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.wal_file_name, "wal.log");
        assert_eq!(config.wal_interval, Duration::from_secs(2));
        assert_eq!(config.max_wal_buffer_entries, 100);
        assert!(config.encryption_key.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new("/tmp/db")
            .wal_file_name("changes.log")
            .cache_limit(3)
            .encryption_key("hunter2")
            .wal_interval(Duration::ZERO);

        assert_eq!(config.database_dir, PathBuf::from("/tmp/db"));
        assert_eq!(config.wal_file_name, "changes.log");
        assert_eq!(config.cache_limit, 3);
        assert_eq!(config.encryption_key.as_deref(), Some("hunter2"));
        assert_eq!(config.wal_interval, Duration::ZERO);
    }
}
