//! # MikroDB Codec
//!
//! Binary table-file format and dynamic value model for MikroDB.
//!
//! A table file is a header followed by a flat run of records:
//!
//! ```text
//! | 'M' 'D' 'B' | version (1) | record count (LE u32) | records... |
//! ```
//!
//! Each record carries a fixed-width prefix (key length, value length,
//! version, timestamp, expiration) and then its key and tagged value bytes.
//! See [`encode_table`] and [`decode_table`].
//!
//! ## Usage
//!
//! ```
//! use mikrodb_codec::{decode_table, encode_table, Record, Value};
//!
//! let record = Record::new(Value::from("hello"), 1, 1_700_000_000_000, None);
//! let bytes = encode_table([("greeting", &record)]).unwrap();
//!
//! let decoded = decode_table(&bytes, 1_700_000_000_000).unwrap();
//! assert_eq!(decoded[0].1, record);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod json;
mod record;
mod value;

pub use decoder::{decode_table, decode_value};
pub use encoder::{encode_table, TableEncoder};
pub use error::{CodecError, CodecResult};
pub use record::Record;
pub use value::Value;

/// Magic bytes identifying a table file.
pub const MAGIC: [u8; 3] = *b"MDB";

/// Current table file format version.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum key length in UTF-8 bytes (the key length field is a u16).
pub const MAX_KEY_LEN: usize = u16::MAX as usize;
