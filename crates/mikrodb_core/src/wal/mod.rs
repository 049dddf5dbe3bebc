//! Write-ahead log.
//!
//! Every mutation is appended to the WAL before it is acknowledged; table
//! files only catch up at flush or checkpoint time. The WAL is a single
//! append-only text file, one entry per line (see [`WalEntry`]), buffered
//! in memory and flushed on count/size triggers, the periodic timer, or an
//! explicit flush.
//!
//! ## Recovery policy
//!
//! Replay is lenient: a malformed line or an entry with bad JSON is logged
//! and skipped, other entries still apply. Entries whose expiration already
//! passed are skipped. Per-table cursors make repeated replay idempotent;
//! they reset when a checkpoint truncates the file.

mod entry;
mod writer;

pub use entry::{WalEntry, WalOp};
pub use writer::{CheckpointRequest, WalLimits, WalManager};
