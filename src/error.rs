//! Error taxonomy returned by every store operation.
//!
//! Storage-engine and cipher errors are flattened into these variants so
//! callers never depend on rusqlite or aes-gcm types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing or unusable secret. Fatal at startup.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Decryption or integrity check failed (tampering or key mismatch).
    #[error("Stored record failed authentication (tampered, or sealed under a different key)")]
    Authentication,

    /// No record matches the key (and owner, for sessions).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Decrypted bytes do not match the expected payload structure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O, lock timeout, deadline or engine failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Transient failures a caller may retry at its discretion.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Persistence(_))
    }

    /// Outcomes the web layer turns into "please sign in again".
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Authentication)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
