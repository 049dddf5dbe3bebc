//! # MikroDB Core
//!
//! Embeddable, table-oriented key-value engine.
//!
//! MikroDB stores named tables of records in a single directory: one binary
//! file per table, plus a line-oriented write-ahead log. This crate
//! provides:
//!
//! - the durable write path (buffered WAL, table-file rewrite via atomic
//!   replace)
//! - the in-memory table layer with LRU eviction
//! - periodic and forced checkpoints with a crash-recovery marker
//! - optional AES-256-GCM envelope encryption of table files
//! - record versioning and lazy expiration
//! - a composable filter/query evaluator
//! - change events (`item.written`, `item.deleted`, `item.expired`,
//!   `table.deleted`)
//!
//! The entry point is [`Database`]. A single instance owns all engine state
//! and serializes mutations internally; files in the database directory
//! must not be shared with another process (an advisory lock enforces
//! this).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod checkpoint;
mod config;
mod crypto;
mod database;
mod dir;
mod error;
mod events;
mod filter;
mod types;
mod wal;

pub use config::Config;
pub use crypto::{EncryptionKey, TableCipher};
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventHub, EventKind, EventSink};
pub use filter::{Condition, FilterExpr, FilterNode, FilterSpec, Operator, QueryOptions};
pub use types::{WriteOp, WriteOptions};
pub use wal::{CheckpointRequest, WalEntry, WalOp};

// The value model and record tuple are defined by the codec crate.
pub use mikrodb_codec::{Record, Value};
