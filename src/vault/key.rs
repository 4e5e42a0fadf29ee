//! Derivation of the storage master key from an operator-supplied secret.
//!
//! The same secret always yields the same key, so ciphertexts written by a
//! previous process stay readable. There is no rotation path: a different
//! secret makes every existing record fail authentication on read.

use crate::error::StoreError;
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Size of the master key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Decoded base64 secrets shorter than this are treated as passphrases.
const MIN_DECODED_SECRET: usize = 16;

/// Padded standard alphabet that tolerates non-zero trailing bits.
const SECRET_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// 256-bit symmetric key used by the envelope cipher.
///
/// Wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Derives the key from a raw secret.
    ///
    /// # Rules
    /// - Empty secret: `KeyDerivation` error
    /// - Valid standard base64 decoding to exactly 32 bytes: used as-is
    /// - Valid standard base64 decoding to 16+ bytes: SHA-256 of the decoded bytes
    /// - Anything else: SHA-256 of the secret's UTF-8 bytes
    ///
    /// CR and LF are skipped while decoding, so a secret read from a file
    /// with a trailing newline gives the same key as without it.
    pub fn derive(secret: &str) -> Result<Self, StoreError> {
        if secret.is_empty() {
            return Err(StoreError::KeyDerivation(
                "secret must not be empty".to_string(),
            ));
        }

        let compact: Zeroizing<String> =
            Zeroizing::new(secret.chars().filter(|c| !matches!(c, '\r' | '\n')).collect());
        if let Ok(decoded) = SECRET_BASE64.decode(compact.as_bytes()) {
            let decoded = Zeroizing::new(decoded);
            if decoded.len() >= MIN_DECODED_SECRET {
                if decoded.len() == KEY_SIZE {
                    let mut key = [0u8; KEY_SIZE];
                    key.copy_from_slice(&decoded);
                    return Ok(Self(key));
                }
                return Ok(Self(Sha256::digest(decoded.as_slice()).into()));
            }
        }

        Ok(Self(Sha256::digest(secret.as_bytes()).into()))
    }

    /// Wraps raw key bytes (e.g. from a keyring).
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;

    const ZERO_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    #[test]
    fn test_empty_secret_rejected() {
        let result = MasterKey::derive("");
        assert!(matches!(result, Err(StoreError::KeyDerivation(_))));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let encoded = BASE64.encode([7u8; 32]);
        for secret in ["hunter2", "c2hvcnQ=", encoded.as_str()] {
            let a = MasterKey::derive(secret).unwrap();
            let b = MasterKey::derive(secret).unwrap();
            assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }

    #[test]
    fn test_32_byte_base64_used_verbatim() {
        let secret = BASE64.encode([0u8; 32]);
        assert_eq!(secret, ZERO_KEY);

        let key = MasterKey::derive(&secret).unwrap();
        assert_eq!(key.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn test_line_breaks_ignored_when_decoding() {
        for secret in [
            format!("{}\n", ZERO_KEY),
            format!("{}\r\n", ZERO_KEY),
            format!("{}\n{}", &ZERO_KEY[..20], &ZERO_KEY[20..]),
        ] {
            let key = MasterKey::derive(&secret).unwrap();
            assert_eq!(key.as_bytes(), &[0u8; 32], "secret {:?}", secret);
        }
    }

    #[test]
    fn test_non_zero_trailing_bits_accepted() {
        // Final 'B' sets a bit past the 32nd byte
        let key = MasterKey::derive("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAB=").unwrap();
        assert_eq!(key.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn test_blank_lines_only_hash_raw_secret() {
        let key = MasterKey::derive("\n").unwrap();
        let expected: [u8; 32] = Sha256::digest(b"\n").into();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_passphrase_is_hashed() {
        let key = MasterKey::derive("hunter2").unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7"
        );
    }

    #[test]
    fn test_medium_base64_hashes_decoded_bytes() {
        // 32 characters of base64 decode to 23 zero bytes, not 32
        let key = MasterKey::derive("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "015275e61fa0d0751c1d9f45541c7804c895404455470710ade3786f282f2da0"
        );
    }

    #[test]
    fn test_long_base64_hashes_decoded_bytes() {
        let decoded = [9u8; 64];
        let key = MasterKey::derive(&BASE64.encode(decoded)).unwrap();
        let expected: [u8; 32] = Sha256::digest(decoded).into();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_short_base64_hashes_raw_secret() {
        // Valid base64, but only 5 bytes once decoded
        let secret = "c2hvcnQ=";
        let key = MasterKey::derive(secret).unwrap();
        let expected: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = MasterKey::from_bytes([0xAB; 32]);
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171"));
        assert!(printed.contains("redacted"));
    }
}
