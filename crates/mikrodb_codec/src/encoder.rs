//! Table file encoder.

use crate::error::{CodecError, CodecResult};
use crate::record::Record;
use crate::value::Value;
use crate::{FORMAT_VERSION, MAGIC, MAX_KEY_LEN};

/// Value tag bytes used on the wire.
pub(crate) mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const FLOAT: u8 = 0x03;
    pub const STRING: u8 = 0x04;
    pub const ARRAY: u8 = 0x05;
    pub const OBJECT: u8 = 0x06;
    pub const DATE: u8 = 0x07;
}

/// Encode a whole table to its file image.
///
/// Records are laid out in iteration order. Records whose key exceeds the
/// 65 535-byte limit are skipped; the engine rejects such keys at write
/// time, so hitting one here means the caller bypassed validation.
///
/// # Errors
///
/// Returns an error if a value is too large for its length prefix.
pub fn encode_table<'a, I>(records: I) -> CodecResult<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a Record)>,
{
    let mut encoder = TableEncoder::new();
    for (key, record) in records {
        encoder.push(key, record)?;
    }
    Ok(encoder.finish())
}

/// An incremental table file encoder.
///
/// Accumulates encoded records and prepends the header on [`finish`](Self::finish).
pub struct TableEncoder {
    body: Vec<u8>,
    count: u32,
}

impl TableEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            body: Vec::new(),
            count: 0,
        }
    }

    /// Append one record.
    ///
    /// Oversized keys are skipped silently (see [`encode_table`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded value exceeds the `u32` length field.
    pub fn push(&mut self, key: &str, record: &Record) -> CodecResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Ok(());
        }
        #[allow(clippy::cast_possible_truncation)]
        let key_len = key.len() as u16;

        let mut value_bytes = Vec::new();
        encode_value(&mut value_bytes, &record.value)?;
        let value_len = u32::try_from(value_bytes.len())
            .map_err(|_| CodecError::encoding_failed("value too large for length prefix"))?;

        self.body.extend_from_slice(&key_len.to_le_bytes());
        self.body.extend_from_slice(&value_len.to_le_bytes());
        self.body.extend_from_slice(&record.version.to_le_bytes());
        self.body.extend_from_slice(&record.timestamp.to_le_bytes());
        self.body
            .extend_from_slice(&record.expiration_wire().to_le_bytes());
        self.body.extend_from_slice(key.as_bytes());
        self.body.extend_from_slice(&value_bytes);
        self.count += 1;
        Ok(())
    }

    /// Consume the encoder and return the complete file image.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC.len() + 5 + self.body.len());
        out.extend_from_slice(&MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

impl Default for TableEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single value with its tag byte.
pub(crate) fn encode_value(buf: &mut Vec<u8>, value: &Value) -> CodecResult<()> {
    match value {
        Value::Null => buf.push(tag::NULL),
        Value::Bool(b) => {
            buf.push(tag::BOOL);
            buf.push(u8::from(*b));
        }
        Value::Int(n) => {
            buf.push(tag::INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(f) => {
            buf.push(tag::FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(tag::STRING);
            let len = u32::try_from(s.len())
                .map_err(|_| CodecError::encoding_failed("string too long"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            buf.push(tag::ARRAY);
            let count = u32::try_from(items.len())
                .map_err(|_| CodecError::encoding_failed("array too long"))?;
            buf.extend_from_slice(&count.to_le_bytes());
            for item in items {
                encode_value(buf, item)?;
            }
        }
        Value::Object(pairs) => {
            buf.push(tag::OBJECT);
            let count = u32::try_from(pairs.len())
                .map_err(|_| CodecError::encoding_failed("object too long"))?;
            buf.extend_from_slice(&count.to_le_bytes());
            for (key, item) in pairs {
                let key_len = u16::try_from(key.len())
                    .map_err(|_| CodecError::encoding_failed("object key too long"))?;
                buf.extend_from_slice(&key_len.to_le_bytes());
                buf.extend_from_slice(key.as_bytes());
                encode_value(buf, item)?;
            }
        }
        Value::Date(ms) => {
            buf.push(tag::DATE);
            buf.extend_from_slice(&ms.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: Value) -> Record {
        Record::new(value, 1, 1_700_000_000_000, None)
    }

    #[test]
    fn header_layout() {
        let bytes = encode_table(std::iter::empty()).unwrap();
        assert_eq!(&bytes[0..3], b"MDB");
        assert_eq!(bytes[3], 1);
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn record_prefix_layout() {
        let rec = Record::new(Value::Null, 3, 42, Some(99));
        let bytes = encode_table([("k", &rec)]).unwrap();

        // count
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        // key length, value length
        assert_eq!(&bytes[8..10], &1u16.to_le_bytes());
        assert_eq!(&bytes[10..14], &1u32.to_le_bytes());
        // version, timestamp, expiration
        assert_eq!(&bytes[14..18], &3u32.to_le_bytes());
        assert_eq!(&bytes[18..26], &42u64.to_le_bytes());
        assert_eq!(&bytes[26..34], &99u64.to_le_bytes());
        // key then null tag
        assert_eq!(bytes[34], b'k');
        assert_eq!(bytes[35], tag::NULL);
    }

    #[test]
    fn no_expiration_encodes_as_zero() {
        let rec = record(Value::Null);
        let bytes = encode_table([("k", &rec)]).unwrap();
        assert_eq!(&bytes[26..34], &0u64.to_le_bytes());
    }

    #[test]
    fn value_tags() {
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::Bool(true)).unwrap();
        assert_eq!(buf, vec![tag::BOOL, 1]);

        buf.clear();
        encode_value(&mut buf, &Value::Int(-2)).unwrap();
        assert_eq!(buf, [vec![tag::INT], (-2i32).to_le_bytes().to_vec()].concat());

        buf.clear();
        encode_value(&mut buf, &Value::Str("hi".to_string())).unwrap();
        assert_eq!(
            buf,
            [vec![tag::STRING], 2u32.to_le_bytes().to_vec(), b"hi".to_vec()].concat()
        );

        buf.clear();
        encode_value(&mut buf, &Value::Date(-5)).unwrap();
        assert_eq!(buf, [vec![tag::DATE], (-5i64).to_le_bytes().to_vec()].concat());
    }

    #[test]
    fn nested_values_encode_recursively() {
        let mut buf = Vec::new();
        let value = Value::Object(vec![(
            "a".to_string(),
            Value::Array(vec![Value::Int(1), Value::Null]),
        )]);
        encode_value(&mut buf, &value).unwrap();

        let mut expected = vec![tag::OBJECT];
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.push(b'a');
        expected.push(tag::ARRAY);
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.push(tag::INT);
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.push(tag::NULL);
        assert_eq!(buf, expected);
    }

    #[test]
    fn oversized_key_is_skipped() {
        let rec = record(Value::Int(1));
        let long_key = "k".repeat(65_536);
        let bytes = encode_table([(long_key.as_str(), &rec), ("ok", &rec)]).unwrap();
        // only the valid record made it in
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
    }
}
