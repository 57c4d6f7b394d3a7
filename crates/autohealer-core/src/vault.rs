//! Secret Vault: AES-256-GCM encryption for stored credentials.
//!
//! The master key is 32 bytes supplied at process start; without a valid key
//! the process must not come up, so [`SecretVault::from_env`] fails instead
//! of degrading. Every encryption uses a fresh random nonce, so identical
//! plaintexts produce distinct ciphertexts.
//!
//! ## Wire format
//!
//! `base64( nonce(12) || ciphertext || tag(16) )`. The empty string maps to
//! the empty string in both directions (sentinel for "no credential").

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{HealerError, HealerResult};

/// AES-256-GCM nonce length (96 bits).
const NONCE_LEN: usize = 12;

/// Environment variable holding the 64-hex-char master key.
const ENV_ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";

/// Authenticated symmetric encryption for credentials at rest, plus
/// deterministic hashing with constant-time verification.
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl SecretVault {
    /// Build a vault from a 32-byte master key.
    pub fn new(master_key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(master_key).expect("key length is 32");
        Self { cipher }
    }

    /// Read the master key from `ENCRYPTION_KEY` (64 hex chars = 32 bytes).
    /// Fails fast when the variable is missing or malformed.
    pub fn from_env() -> HealerResult<Self> {
        let raw = std::env::var(ENV_ENCRYPTION_KEY)
            .map_err(|_| HealerError::Crypto(format!("{ENV_ENCRYPTION_KEY} is not set")))?;
        let hex = raw.trim();
        if hex.len() != 64 {
            return Err(HealerError::Crypto(format!(
                "{ENV_ENCRYPTION_KEY} must be 64 hex chars (32 bytes)"
            )));
        }
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
                HealerError::Crypto(format!("{ENV_ENCRYPTION_KEY} contains non-hex characters"))
            })?;
        }
        Ok(Self::new(&key))
    }

    /// Encrypt a credential. Empty input maps to empty output.
    pub fn encrypt(&self, plaintext: &str) -> HealerResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| HealerError::Crypto(format!("encryption failed: {e}")))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    /// Decrypt a credential previously produced by [`encrypt`](Self::encrypt).
    /// Empty input maps to empty output. Any tampering, truncation, bad
    /// base64, or wrong key collapses to a single opaque error.
    pub fn decrypt(&self, ciphertext: &str) -> HealerResult<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let blob = B64
            .decode(ciphertext.trim())
            .map_err(|_| decryption_failed())?;
        if blob.len() <= NONCE_LEN {
            return Err(decryption_failed());
        }
        let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ct)
            .map_err(|_| decryption_failed())?;
        String::from_utf8(plaintext).map_err(|_| decryption_failed())
    }

    /// Deterministic SHA-256 hash, lowercase hex (64 chars).
    pub fn hash(input: &str) -> String {
        let digest = Sha256::digest(input.as_bytes());
        let mut out = String::with_capacity(64);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Constant-time comparison of `input`'s hash against `expected_hex`.
    pub fn verify_hash(input: &str, expected_hex: &str) -> bool {
        let actual = Self::hash(input);
        if actual.len() != expected_hex.len() {
            return false;
        }
        actual
            .as_bytes()
            .ct_eq(expected_hex.as_bytes())
            .unwrap_u8()
            == 1
    }
}

fn decryption_failed() -> HealerError {
    HealerError::Crypto("Decryption failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13).wrapping_add(7);
        }
        key
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = SecretVault::new(&test_key());
        let secret = "db-password-!@#unicode-ü";
        let ct = vault.encrypt(secret).unwrap();
        assert_ne!(ct, secret);
        assert!(!ct.contains("password"));
        assert_eq!(vault.decrypt(&ct).unwrap(), secret);
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let vault = SecretVault::new(&test_key());
        let a = vault.encrypt("same plaintext").unwrap();
        let b = vault.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_maps_to_empty() {
        let vault = SecretVault::new(&test_key());
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt("").unwrap(), "");
    }

    #[test]
    fn tampering_is_detected() {
        let vault = SecretVault::new(&test_key());
        let ct = vault.encrypt("secret").unwrap();
        let mut bytes = B64.decode(&ct).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = B64.encode(bytes);
        match vault.decrypt(&tampered) {
            Err(HealerError::Crypto(msg)) => assert_eq!(msg, "Decryption failed"),
            other => panic!("expected crypto error, got {other:?}"),
        }
    }

    #[test]
    fn bad_base64_and_short_blob_rejected() {
        let vault = SecretVault::new(&test_key());
        assert!(vault.decrypt("not base64 !!!").is_err());
        assert!(vault.decrypt(&B64.encode([1u8; 8])).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let vault1 = SecretVault::new(&test_key());
        let mut other = test_key();
        other[0] ^= 0xFF;
        let vault2 = SecretVault::new(&other);
        let ct = vault1.encrypt("secret").unwrap();
        assert!(vault2.decrypt(&ct).is_err());
    }

    #[test]
    fn hash_is_deterministic_and_verifiable() {
        let h1 = SecretVault::hash("payload");
        let h2 = SecretVault::hash("payload");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(SecretVault::verify_hash("payload", &h1));
        assert!(!SecretVault::verify_hash("payload2", &h1));
        assert!(!SecretVault::verify_hash("payload", "deadbeef"));
    }
}
