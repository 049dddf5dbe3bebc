//! AES-256-GCM envelope implementation.

use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM IV in bytes.
pub const IV_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Envelope format version byte.
pub const ENVELOPE_VERSION: u8 = 1;

/// Fixed key-derivation salt. Keys are deterministic from the password
/// alone; changing this orphans every existing encrypted file.
const KDF_SALT: &str = "salt";

/// Envelope header length: version + iv_len + iv + tag_len + tag.
const HEADER_LEN: usize = 1 + 1 + IV_SIZE + 1 + TAG_SIZE;

/// Encryption key for AES-256-GCM.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Derives a key from a password with scrypt.
    ///
    /// The scrypt input is the concatenation `"salt#<password>"` with the
    /// fixed salt, N=2^14, r=8, p=1, matching the existing file format.
    ///
    /// # Errors
    ///
    /// Returns an error if the derivation parameters are rejected.
    pub fn derive_from_password(password: &str) -> CoreResult<Self> {
        let params = scrypt::Params::new(14, 8, 1, KEY_SIZE)
            .map_err(|e| CoreError::key_derivation_failed(e.to_string()))?;

        let input = format!("{KDF_SALT}#{password}");
        let mut bytes = [0u8; KEY_SIZE];
        scrypt::scrypt(input.as_bytes(), KDF_SALT.as_bytes(), &params, &mut bytes)
            .map_err(|e| CoreError::key_derivation_failed(e.to_string()))?;

        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice. Never log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seals and opens whole table-file images.
pub struct TableCipher {
    cipher: Aes256Gcm,
}

impl TableCipher {
    /// Creates a cipher from a derived key.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        // Infallible: EncryptionKey is always exactly the AES-256 key size.
        let key_array = GenericArray::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key_array),
        }
    }

    /// Creates a cipher directly from a password.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails.
    pub fn from_password(password: &str) -> CoreResult<Self> {
        Ok(Self::new(&EncryptionKey::derive_from_password(password)?))
    }

    /// Returns true if `bytes` starts with the envelope version byte.
    ///
    /// Only meaningful when encryption is configured; a plaintext table
    /// file starts with `M` (0x4D) and never matches.
    #[must_use]
    pub fn looks_encrypted(bytes: &[u8]) -> bool {
        bytes.first() == Some(&ENVELOPE_VERSION)
    }

    /// Encrypts a plaintext table image into its envelope.
    ///
    /// A fresh random 96-bit IV is drawn per call.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CoreError::encryption_failed("encryption error"))?;

        // The AEAD output is ciphertext || tag; the envelope stores the tag
        // in the header instead.
        let tag_start = ciphertext.len() - TAG_SIZE;
        let tag: Vec<u8> = ciphertext.split_off(tag_start);

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.push(ENVELOPE_VERSION);
        out.push(IV_SIZE as u8);
        out.extend_from_slice(&iv);
        out.push(TAG_SIZE as u8);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts an envelope back into the plaintext table image.
    ///
    /// # Errors
    ///
    /// Returns a decryption error on a malformed header, an unexpected IV
    /// or tag length, or an authentication failure.
    pub fn open(&self, envelope: &[u8]) -> CoreResult<Vec<u8>> {
        if envelope.len() < HEADER_LEN {
            return Err(CoreError::decryption_failed("envelope too short"));
        }
        if envelope[0] != ENVELOPE_VERSION {
            return Err(CoreError::decryption_failed(format!(
                "unsupported envelope version {}",
                envelope[0]
            )));
        }
        if envelope[1] as usize != IV_SIZE {
            return Err(CoreError::decryption_failed("unexpected IV length"));
        }
        let iv = &envelope[2..2 + IV_SIZE];
        if envelope[2 + IV_SIZE] as usize != TAG_SIZE {
            return Err(CoreError::decryption_failed("unexpected tag length"));
        }
        let tag = &envelope[3 + IV_SIZE..HEADER_LEN];
        let ciphertext = &envelope[HEADER_LEN..];

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let nonce = Nonce::from_slice(iv);
        self.cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| CoreError::decryption_failed("authentication failed"))
    }
}

impl std::fmt::Debug for TableCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}
