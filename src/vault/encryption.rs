//! AES-256-GCM envelope encryption for stored payloads.
//!
//! Every seal draws a fresh random nonce from the OS CSPRNG and prepends it to
//! the ciphertext, so a stored blob is self-contained:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ nonce (12 B) │ ciphertext || tag (16 B)     │
//! └──────────────┴──────────────────────────────┘
//! ```

use super::key::MasterKey;
use crate::error::StoreError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Authenticated cipher bound to one master key.
///
/// Built once at startup; cloning shares nothing mutable, so it can be used
/// from any number of tasks at once.
#[derive(Clone)]
pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
}

impl EnvelopeCipher {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Encrypts `plaintext`, authenticating `aad` alongside it.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - `nonce || ciphertext`
    /// * `Err` - Only if the plaintext exceeds the GCM message limit
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StoreError> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| StoreError::Serialization("payload too large to encrypt".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`seal`](Self::seal) with the same `aad`.
    ///
    /// Any failure (short blob, wrong key, bit-flip, truncation, wrong `aad`)
    /// is reported as `StoreError::Authentication`.
    pub fn open(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StoreError::Authentication);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| StoreError::Authentication)
    }
}
