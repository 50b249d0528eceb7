//! Zero-knowledge envelope codec.
//!
//! A ZK envelope is produced *client-side*: the server stores it as opaque
//! bytes and only ever inspects the leading `$ZK$` marker to derive the
//! `zkEncrypted` flag. The codec here is the reference implementation the
//! client SDKs are kept bit-compatible with; the server itself never calls
//! [`open`] on stored data.
//!
//! Envelope format:
//!
//! ```text
//! $ZK$ || base64( salt(16) || nonce(12) || ciphertext || tag(16) )
//! ```
//!
//! Key derivation is Argon2id `{t=1, m=64 MiB, p=4, out=32}` over the
//! passphrase, which must be at least 16 bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto::{self, RECORD_OVERHEAD};
use crate::error::CryptoError;

/// The envelope marker.
pub const ZK_MARKER: &[u8] = b"$ZK$";

/// Minimum passphrase length in bytes.
pub const MIN_PASSPHRASE_BYTES: usize = 16;

/// Whether a stored value is a ZK envelope.
#[must_use]
pub fn is_zk(value: &[u8]) -> bool {
    value.starts_with(ZK_MARKER)
}

/// Total envelope size for a plaintext of the given length.
///
/// Marker plus the base64 expansion of `plaintext + 44` bytes of salt,
/// nonce, and tag.
#[must_use]
pub fn envelope_len(plaintext_len: usize) -> usize {
    let raw = plaintext_len + RECORD_OVERHEAD;
    ZK_MARKER.len() + raw.div_ceil(3) * 4
}

/// Seal a plaintext into a ZK envelope.
///
/// # Errors
///
/// Returns [`CryptoError::PassphraseTooShort`] for a passphrase under 16
/// bytes, or a derivation/encryption error.
pub fn seal(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if passphrase.len() < MIN_PASSPHRASE_BYTES {
        return Err(CryptoError::PassphraseTooShort {
            min: MIN_PASSPHRASE_BYTES,
            actual: passphrase.len(),
        });
    }

    let master = crypto::MasterKey::new(passphrase.to_vec());
    let record = crypto::encrypt_record(&master, plaintext)?;

    let mut envelope = Vec::with_capacity(envelope_len(plaintext.len()));
    envelope.extend_from_slice(ZK_MARKER);
    envelope.extend_from_slice(BASE64.encode(&record).as_bytes());
    Ok(envelope)
}

/// Open a ZK envelope.
///
/// # Errors
///
/// Returns [`CryptoError::Envelope`] for a missing marker or bad base64,
/// [`CryptoError::PassphraseTooShort`] for an undersized passphrase, and
/// [`CryptoError::Decryption`] when the passphrase is wrong or the payload
/// was tampered with — never silent garbage.
pub fn open(passphrase: &[u8], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if passphrase.len() < MIN_PASSPHRASE_BYTES {
        return Err(CryptoError::PassphraseTooShort {
            min: MIN_PASSPHRASE_BYTES,
            actual: passphrase.len(),
        });
    }

    let encoded = envelope
        .strip_prefix(ZK_MARKER)
        .ok_or_else(|| CryptoError::Envelope {
            reason: "missing $ZK$ marker".to_owned(),
        })?;
    let record = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::Envelope {
            reason: format!("invalid base64 payload: {e}"),
        })?;

    let master = crypto::MasterKey::new(passphrase.to_vec());
    crypto::decrypt_record(&master, &record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PASSPHRASE: &[u8] = b"correct horse battery";

    #[test]
    fn seal_open_roundtrip() {
        let envelope = seal(PASSPHRASE, b"topsecret").unwrap();
        assert!(is_zk(&envelope));
        assert_eq!(open(PASSPHRASE, &envelope).unwrap(), b"topsecret");
    }

    #[test]
    fn envelope_is_ascii_marker_plus_base64() {
        let envelope = seal(PASSPHRASE, b"data").unwrap();
        assert!(envelope.starts_with(b"$ZK$"));
        assert!(envelope[4..].iter().all(u8::is_ascii));
        assert_eq!(envelope.len(), envelope_len(4));
    }

    #[test]
    fn short_passphrase_rejected() {
        assert!(matches!(
            seal(b"too-short", b"data"),
            Err(CryptoError::PassphraseTooShort { min: 16, actual: 9 })
        ));
        assert!(matches!(
            open(b"too-short", b"$ZK$AAAA"),
            Err(CryptoError::PassphraseTooShort { .. })
        ));
    }

    #[test]
    fn sixteen_byte_passphrase_is_accepted() {
        let pass = b"0123456789abcdef";
        let envelope = seal(pass, b"x").unwrap();
        assert_eq!(open(pass, &envelope).unwrap(), b"x");
    }

    #[test]
    fn wrong_passphrase_fails_never_garbage() {
        let envelope = seal(PASSPHRASE, b"topsecret").unwrap();
        let result = open(b"an entirely wrong passphrase", &envelope);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn missing_marker_rejected() {
        assert!(matches!(
            open(PASSPHRASE, b"ZK$nope"),
            Err(CryptoError::Envelope { .. })
        ));
    }

    #[test]
    fn corrupt_base64_rejected() {
        let mut envelope = seal(PASSPHRASE, b"data").unwrap();
        envelope.push(b'!');
        assert!(matches!(
            open(PASSPHRASE, &envelope),
            Err(CryptoError::Envelope { .. })
        ));
    }

    #[test]
    fn detection_only_looks_at_marker() {
        assert!(is_zk(b"$ZK$whatever"));
        assert!(!is_zk(b"$zk$lowercase"));
        assert!(!is_zk(b"plain"));
        assert!(!is_zk(b""));
    }
}
