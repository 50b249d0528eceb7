//! Cryptographic primitives for Stash.
//!
//! Provides the at-rest record encryption used for secrets paths and the
//! Argon2id key derivation shared with the zero-knowledge envelope codec.
//!
//! # Security model
//!
//! - Every record is encrypted under its own key, derived from the master
//!   key and a fresh random 16-byte salt via Argon2id.
//! - Record layout: `salt (16) || nonce (12) || ciphertext || tag (16)` —
//!   44 bytes of overhead.
//! - AES-256-GCM with a fresh 96-bit nonce per write; the 128-bit tag is
//!   appended by the AEAD.
//! - The master key is zeroized on drop and never appears in `Debug` output.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Salt length for per-record key derivation.
pub const SALT_LEN: usize = 16;

/// Nonce length for AES-256-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// Tag length appended by AES-256-GCM (128 bits).
pub const TAG_LEN: usize = 16;

/// Fixed overhead of an encrypted record: salt + nonce + tag.
pub const RECORD_OVERHEAD: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// Argon2id memory cost in KiB (64 MiB).
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id iteration count.
const ARGON2_TIME: u32 = 1;
/// Argon2id lane count.
const ARGON2_LANES: u32 = 4;
/// Derived key length in bytes.
const DERIVED_KEY_LEN: usize = 32;

/// The secrets master key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    /// Wrap raw key material (typically the configured passphrase bytes).
    #[must_use]
    pub fn new(material: Vec<u8>) -> Self {
        Self(material)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a 256-bit AEAD key from secret material and a salt with Argon2id
/// `{t=1, m=64 MiB, p=4}`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the parameters are rejected or
/// derivation fails.
pub fn derive_key(secret: &[u8], salt: &[u8]) -> Result<[u8; DERIVED_KEY_LEN], CryptoError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME,
        ARGON2_LANES,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| CryptoError::KeyDerivation {
        reason: e.to_string(),
    })?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut derived = [0u8; DERIVED_KEY_LEN];
    argon2
        .hash_password_into(secret, salt, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;
    Ok(derived)
}

/// Encrypt a value for at-rest storage.
///
/// Returns `salt || nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] or [`CryptoError::Encryption`] on
/// failure.
pub fn encrypt_record(master: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut key_bytes = derive_key(master.as_bytes(), &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        });
    key_bytes.zeroize();
    let ciphertext = ciphertext?;

    let mut record = Vec::with_capacity(RECORD_OVERHEAD + plaintext.len());
    record.extend_from_slice(&salt);
    record.extend_from_slice(&nonce);
    record.extend_from_slice(&ciphertext);
    Ok(record)
}

/// Decrypt a record produced by [`encrypt_record`].
///
/// # Errors
///
/// Returns [`CryptoError::RecordTooShort`] for truncated input and
/// [`CryptoError::Decryption`] when authentication fails (wrong master key,
/// corrupted data, or tampered tag).
pub fn decrypt_record(master: &MasterKey, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if record.len() < RECORD_OVERHEAD {
        return Err(CryptoError::RecordTooShort {
            expected: RECORD_OVERHEAD,
            actual: record.len(),
        });
    }

    let (salt, rest) = record.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let mut key_bytes = derive_key(master.as_bytes(), salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        });
    key_bytes.zeroize();
    plaintext
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn master() -> MasterKey {
        MasterKey::new(b"unit-test-master-key".to_vec())
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = master();
        let record = encrypt_record(&key, b"db password").unwrap();
        assert_eq!(decrypt_record(&key, &record).unwrap(), b"db password");
    }

    #[test]
    fn record_overhead_is_exactly_44() {
        let key = master();
        let record = encrypt_record(&key, b"hello").unwrap();
        assert_eq!(record.len(), 5 + RECORD_OVERHEAD);
        assert_eq!(RECORD_OVERHEAD, 44);
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let key = master();
        let record = encrypt_record(&key, b"hello").unwrap();
        assert!(!record.windows(5).any(|w| w == b"hello"));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = master();
        let record = encrypt_record(&key, b"").unwrap();
        assert_eq!(record.len(), RECORD_OVERHEAD);
        assert!(decrypt_record(&key, &record).unwrap().is_empty());
    }

    #[test]
    fn wrong_master_key_fails_authentication() {
        let record = encrypt_record(&master(), b"secret").unwrap();
        let other = MasterKey::new(b"a different master key".to_vec());
        assert!(matches!(
            decrypt_record(&other, &record),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let key = master();
        let mut record = encrypt_record(&key, b"secret").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        assert!(matches!(
            decrypt_record(&key, &record),
            Err(CryptoError::Decryption { .. })
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        assert!(matches!(
            decrypt_record(&master(), &[0u8; 20]),
            Err(CryptoError::RecordTooShort {
                expected: 44,
                actual: 20
            })
        ));
    }

    #[test]
    fn fresh_salt_per_record() {
        let key = master();
        let a = encrypt_record(&key, b"same").unwrap();
        let b = encrypt_record(&key, b"same").unwrap();
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn master_key_debug_is_redacted() {
        let debug = format!("{:?}", master());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("unit-test"));
    }
}
