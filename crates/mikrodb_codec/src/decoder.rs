//! Table file decoder.

use crate::encoder::tag;
use crate::error::{CodecError, CodecResult};
use crate::record::Record;
use crate::value::Value;
use crate::{FORMAT_VERSION, MAGIC};

/// Fixed-width prefix preceding each record's key and value bytes.
const RECORD_PREFIX_LEN: usize = 2 + 4 + 4 + 8 + 8;

/// Decode a table file image into its live records.
///
/// The header is validated strictly: a bad magic or an unknown version byte
/// is a fatal error. The record stream is handled leniently, matching what
/// a crash mid-replace can leave behind:
///
/// - truncation terminates decoding silently, returning the records read
///   so far;
/// - a record carrying an unknown value tag (or a malformed value body) is
///   skipped using its length prefix;
/// - records whose expiration is at or before `now_ms` are dropped.
///
/// # Errors
///
/// Returns [`CodecError::InvalidMagic`] or [`CodecError::UnsupportedVersion`]
/// when the header is unusable.
pub fn decode_table(bytes: &[u8], now_ms: u64) -> CodecResult<Vec<(String, Record)>> {
    if bytes.len() < MAGIC.len() + 1 || bytes[..MAGIC.len()] != MAGIC {
        return Err(CodecError::InvalidMagic);
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion { version });
    }

    let mut cursor = Cursor::new(&bytes[MAGIC.len() + 1..]);
    let Ok(count) = cursor.read_u32() else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    for _ in 0..count {
        if cursor.remaining() < RECORD_PREFIX_LEN {
            break;
        }
        // The prefix reads cannot fail past this point.
        let key_len = cursor.read_u16().unwrap_or(0) as usize;
        let value_len = cursor.read_u32().unwrap_or(0) as usize;
        let version = cursor.read_u32().unwrap_or(0);
        let timestamp = cursor.read_u64().unwrap_or(0);
        let expiration = cursor.read_u64().unwrap_or(0);

        let Ok(key_bytes) = cursor.read_bytes(key_len) else {
            break;
        };
        let Ok(value_bytes) = cursor.read_bytes(value_len) else {
            break;
        };

        let Ok(key) = std::str::from_utf8(key_bytes) else {
            continue;
        };
        let Ok(value) = decode_value(value_bytes) else {
            continue;
        };

        let expiration = Record::expiration_from_wire(expiration);
        let record = Record {
            value,
            version,
            timestamp,
            expiration,
        };
        if record.is_expired(now_ms) {
            continue;
        }
        records.push((key.to_string(), record));
    }

    Ok(records)
}

/// Decode a single tagged value from a byte slice.
///
/// # Errors
///
/// Returns an error on unknown tags, truncation, or invalid UTF-8.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let mut cursor = Cursor::new(bytes);
    cursor.decode_value()
}

/// A bounds-checked read cursor.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> CodecResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> CodecResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> CodecResult<u64> {
        let bytes: [u8; 8] = self
            .read_bytes(8)?
            .try_into()
            .map_err(|_| CodecError::UnexpectedEof)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_i32(&mut self) -> CodecResult<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i64(&mut self) -> CodecResult<i64> {
        let bytes: [u8; 8] = self
            .read_bytes(8)?
            .try_into()
            .map_err(|_| CodecError::UnexpectedEof)?;
        Ok(i64::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> CodecResult<f64> {
        let bytes: [u8; 8] = self
            .read_bytes(8)?
            .try_into()
            .map_err(|_| CodecError::UnexpectedEof)?;
        Ok(f64::from_le_bytes(bytes))
    }

    /// Reads a count prefix and sanity-checks it against the remaining
    /// bytes. Every encoded element occupies at least one byte, so a count
    /// larger than the remainder is malformed and must not drive an
    /// allocation.
    fn read_count(&mut self) -> CodecResult<usize> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            return Err(CodecError::LengthOutOfBounds {
                claimed: count,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    fn decode_value(&mut self) -> CodecResult<Value> {
        let tag_byte = self.read_u8()?;
        match tag_byte {
            tag::NULL => Ok(Value::Null),
            tag::BOOL => Ok(Value::Bool(self.read_u8()? != 0)),
            tag::INT => Ok(Value::Int(self.read_i32()?)),
            tag::FLOAT => Ok(Value::Float(self.read_f64()?)),
            tag::STRING => {
                let len = self.read_u32()? as usize;
                let bytes = self.read_bytes(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Str(text.to_string()))
            }
            tag::ARRAY => {
                let count = self.read_count()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.decode_value()?);
                }
                Ok(Value::Array(items))
            }
            tag::OBJECT => {
                let count = self.read_count()?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = self.read_u16()? as usize;
                    let key_bytes = self.read_bytes(key_len)?;
                    let key = std::str::from_utf8(key_bytes)
                        .map_err(|_| CodecError::InvalidUtf8)?
                        .to_string();
                    let value = self.decode_value()?;
                    pairs.push((key, value));
                }
                Ok(Value::Object(pairs))
            }
            tag::DATE => Ok(Value::Date(self.read_i64()?)),
            other => Err(CodecError::UnknownTag { tag: other }),
        }
    }
}
