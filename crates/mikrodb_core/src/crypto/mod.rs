//! Envelope encryption for table files.
//!
//! A table file is encrypted as one blob with AES-256-GCM. The envelope
//! layout is:
//!
//! ```text
//! | version (1) | iv_len (1) | iv (12) | tag_len (1) | tag (16) | ciphertext |
//! ```
//!
//! Detection is by the leading version byte: when encryption is configured
//! and a file starts with `0x01`, it is unwrapped; otherwise it is read as
//! plaintext, which lets unencrypted files survive an encryption rollout.

mod envelope;

pub use envelope::{EncryptionKey, TableCipher, ENVELOPE_VERSION, IV_SIZE, KEY_SIZE, TAG_SIZE};
