//! WAL entry grammar.
//!
//! One entry per line:
//!
//! ```text
//! <timestampMs> <op> <table> v:<version> x:<expiration> <key> <jsonValue>\n
//! ```
//!
//! `op` is `W` (write) or `D` (delete, with a `null` value). The first six
//! fields are whitespace-free (enforced at write time), so the JSON tail
//! may contain spaces.

use crate::error::{CoreError, CoreResult};
use mikrodb_codec::Value;

/// Operation kind of a WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    /// A record write.
    Write,
    /// A record delete.
    Delete,
}

impl WalOp {
    /// Wire letter of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Write => "W",
            Self::Delete => "D",
        }
    }

    /// Parses the wire letter.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "W" => Some(Self::Write),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A parsed WAL entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Epoch milliseconds when the mutation happened.
    pub timestamp: u64,
    /// Write or delete.
    pub op: WalOp,
    /// Target table.
    pub table: String,
    /// Record version assigned by the mutation.
    pub version: u32,
    /// Expiration deadline (epoch ms), if any.
    pub expiration: Option<u64>,
    /// Record key.
    pub key: String,
    /// Written value; `Null` for deletes.
    pub value: Value,
}

impl WalEntry {
    /// Creates a write entry.
    #[must_use]
    pub fn write(
        timestamp: u64,
        table: &str,
        key: &str,
        version: u32,
        expiration: Option<u64>,
        value: Value,
    ) -> Self {
        Self {
            timestamp,
            op: WalOp::Write,
            table: table.to_string(),
            version,
            expiration,
            key: key.to_string(),
            value,
        }
    }

    /// Creates a delete entry.
    #[must_use]
    pub fn delete(timestamp: u64, table: &str, key: &str, version: u32) -> Self {
        Self {
            timestamp,
            op: WalOp::Delete,
            table: table.to_string(),
            version,
            expiration: None,
            key: key.to_string(),
            value: Value::Null,
        }
    }

    /// Returns true if the entry's expiration has passed at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expiration, Some(deadline) if deadline <= now_ms)
    }

    /// Formats the entry as one WAL line, without the trailing newline.
    #[must_use]
    pub fn format_line(&self) -> String {
        let json = match self.op {
            WalOp::Write => self.value.to_json().to_string(),
            WalOp::Delete => "null".to_string(),
        };
        format!(
            "{} {} {} v:{} x:{} {} {}",
            self.timestamp,
            self.op.as_str(),
            self.table,
            self.version,
            self.expiration.unwrap_or(0),
            self.key,
            json
        )
    }

    /// Parses one WAL line.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the line has too few fields, a field
    /// fails to parse, or the value tail is not valid JSON. Callers log and
    /// skip such lines; they never abort replay.
    pub fn parse_line(line: &str) -> CoreResult<Self> {
        let mut parts = line.splitn(7, ' ');
        let mut next = |what: &str| {
            parts
                .next()
                .ok_or_else(|| CoreError::corruption(format!("WAL line missing {what}")))
        };

        let timestamp = next("timestamp")?
            .parse::<u64>()
            .map_err(|_| CoreError::corruption("WAL line has invalid timestamp"))?;
        let op = WalOp::from_str_opt(next("op")?)
            .ok_or_else(|| CoreError::corruption("WAL line has invalid op"))?;
        let table = next("table")?.to_string();

        let version_field = next("version")?;
        let version = version_field
            .strip_prefix("v:")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| CoreError::corruption("WAL line has invalid version field"))?;

        let expiration_field = next("expiration")?;
        let expiration_raw = expiration_field
            .strip_prefix("x:")
            .and_then(|x| x.parse::<u64>().ok())
            .ok_or_else(|| CoreError::corruption("WAL line has invalid expiration field"))?;
        let expiration = if expiration_raw == 0 {
            None
        } else {
            Some(expiration_raw)
        };

        let key = next("key")?.to_string();
        let json_tail = next("value")?;
        let json: serde_json::Value = serde_json::from_str(json_tail)
            .map_err(|e| CoreError::corruption(format!("WAL line has invalid JSON value: {e}")))?;

        Ok(Self {
            timestamp,
            op,
            table,
            version,
            expiration,
            key,
            value: Value::from_json(&json),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_line_roundtrip() {
        let entry = WalEntry::write(
            1_700_000_000_123,
            "users",
            "u1",
            2,
            Some(1_800_000_000_000),
            Value::Object(vec![("name".to_string(), Value::Str("Jane".to_string()))]),
        );
        let line = entry.format_line();
        assert_eq!(
            line,
            r#"1700000000123 W users v:2 x:1800000000000 u1 {"name":"Jane"}"#
        );
        assert_eq!(WalEntry::parse_line(&line).unwrap(), entry);
    }

    #[test]
    fn delete_line_roundtrip() {
        let entry = WalEntry::delete(42, "users", "u1", 3);
        let line = entry.format_line();
        assert_eq!(line, "42 D users v:3 x:0 u1 null");
        assert_eq!(WalEntry::parse_line(&line).unwrap(), entry);
    }

    #[test]
    fn json_tail_may_contain_spaces() {
        let entry = WalEntry::write(
            1,
            "t",
            "k",
            1,
            None,
            Value::Str("hello world, again".to_string()),
        );
        let parsed = WalEntry::parse_line(&entry.format_line()).unwrap();
        assert_eq!(parsed.value, Value::Str("hello world, again".to_string()));
    }

    #[test]
    fn zero_expiration_means_none() {
        let parsed = WalEntry::parse_line("1 W t v:1 x:0 k 5").unwrap();
        assert_eq!(parsed.expiration, None);

        let parsed = WalEntry::parse_line("1 W t v:1 x:99 k 5").unwrap();
        assert_eq!(parsed.expiration, Some(99));
    }

    #[test]
    fn malformed_lines_rejected() {
        for line in [
            "",
            "not-a-ts W t v:1 x:0 k null",
            "1 Q t v:1 x:0 k null",
            "1 W t version-less x:0 k null",
            "1 W t v:1 x:0 k {broken",
            "1 W t v:1",
        ] {
            assert!(WalEntry::parse_line(line).is_err(), "line {line:?} parsed");
        }
    }

    #[test]
    fn expiry_check() {
        let entry = WalEntry::write(1, "t", "k", 1, Some(100), Value::Null);
        assert!(entry.is_expired(100));
        assert!(!entry.is_expired(99));
        assert!(!WalEntry::delete(1, "t", "k", 1).is_expired(u64::MAX));
    }
}
