//! Operation types shared across the engine.

use crate::error::{CoreError, CoreResult};
use mikrodb_codec::{Value, MAX_KEY_LEN};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single write operation.
#[derive(Debug, Clone)]
pub struct WriteOp {
    /// Target table; created implicitly if absent.
    pub table: String,
    /// Record key.
    pub key: String,
    /// Value to store.
    pub value: Value,
    /// Optimistic-concurrency token: the write succeeds only if the
    /// record's current version equals this value (0 for "must not exist").
    pub expected_version: Option<u32>,
    /// Absolute expiration deadline in epoch milliseconds.
    pub expiration: Option<u64>,
}

impl WriteOp {
    /// Creates a plain write with no version check and no expiration.
    #[must_use]
    pub fn new(table: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            value,
            expected_version: None,
            expiration: None,
        }
    }

    /// Sets the expected version.
    #[must_use]
    pub const fn expected_version(mut self, version: u32) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Sets the expiration deadline.
    #[must_use]
    pub const fn expiration(mut self, deadline_ms: u64) -> Self {
        self.expiration = Some(deadline_ms);
        self
    }
}

/// Options controlling a write call.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Batch slice size; each slice completes before the next starts.
    pub concurrency_limit: usize,
    /// Flush the WAL buffer and all pending writes before returning.
    pub flush_immediately: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            flush_immediately: false,
        }
    }
}

impl WriteOptions {
    /// Creates options that flush before returning.
    #[must_use]
    pub fn flushed() -> Self {
        Self {
            flush_immediately: true,
            ..Self::default()
        }
    }
}

/// Validates a table name for use in file paths and WAL lines.
///
/// # Errors
///
/// Returns a validation error for empty names, names containing
/// whitespace, or names containing path separators.
pub fn validate_table_name(table: &str) -> CoreResult<()> {
    if table.is_empty() {
        return Err(CoreError::validation("table name must not be empty"));
    }
    if table.chars().any(char::is_whitespace) {
        return Err(CoreError::validation(format!(
            "table name {table:?} must not contain whitespace"
        )));
    }
    if table.contains('/') || table.contains('\\') || table == "." || table == ".." {
        return Err(CoreError::validation(format!(
            "table name {table:?} must not contain path separators"
        )));
    }
    Ok(())
}

/// Validates a record key for the WAL line format and the key-length field.
///
/// # Errors
///
/// Returns a validation error for empty keys, keys containing whitespace,
/// or keys longer than 65 535 UTF-8 bytes.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::validation("key must not be empty"));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(CoreError::validation(format!(
            "key {key:?} must not contain whitespace"
        )));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CoreError::validation(format!(
            "key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

/// Current wall clock in epoch milliseconds.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_rules() {
        assert!(validate_table_name("users").is_ok());
        assert!(validate_table_name("user_profiles-2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("has space").is_err());
        assert!(validate_table_name("line\nbreak").is_err());
        assert!(validate_table_name("a/b").is_err());
        assert!(validate_table_name("..").is_err());
    }

    #[test]
    fn key_rules() {
        assert!(validate_key("user:1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a b").is_err());
        assert!(validate_key("a\tb").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn write_op_builder() {
        let op = WriteOp::new("users", "u1", Value::Int(1))
            .expected_version(2)
            .expiration(5_000);
        assert_eq!(op.expected_version, Some(2));
        assert_eq!(op.expiration, Some(5_000));
    }
}
