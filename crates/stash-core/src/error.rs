//! Error types for `stash-core`.
//!
//! One enum per subsystem. Variants carry enough context to diagnose the
//! problem without a debugger; crypto errors never include key material or
//! plaintext. The HTTP layer maps these onto status codes — revision and
//! event failures deliberately have no mapping because they are never
//! surfaced to callers.

use stash_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Argon2 key derivation failed.
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Stored record is too short to contain salt + nonce + tag.
    #[error("record too short: expected at least {expected} bytes, got {actual}")]
    RecordTooShort { expected: usize, actual: usize },

    /// A zero-knowledge envelope failed to parse.
    #[error("malformed envelope: {reason}")]
    Envelope { reason: String },

    /// The envelope passphrase is below the minimum length.
    #[error("passphrase too short: need at least {min} bytes, got {actual}")]
    PassphraseTooShort { min: usize, actual: usize },
}

/// Errors from the KV store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The key does not exist.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// Optimistic-lock mismatch: the row changed since the caller read it.
    #[error("version conflict on key: {key}")]
    Conflict { key: String },

    /// A secrets path was written without a configured master key.
    #[error("secrets storage is disabled (no master key configured): {key}")]
    SecretsDisabled { key: String },

    /// The key failed normalization.
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Encrypting or decrypting a secrets value failed.
    #[error("secrets crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors from loading or validating the auth config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read auth config '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The document is not valid YAML.
    #[error("failed to parse auth config: {reason}")]
    Parse { reason: String },

    /// The document parsed but violates a structural rule.
    #[error("invalid auth config: {reason}")]
    Invalid { reason: String },
}

/// Errors from the auth service.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The session store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A filter field held an unknown enum value.
    #[error("invalid audit filter: {reason}")]
    InvalidFilter { reason: String },

    /// The audit table could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the git revision store.
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    /// No commit for this key (or the commit id is unknown).
    #[error("no revision found for key: {key}")]
    NotFound { key: String },

    /// The key cannot be mapped to a repository path.
    #[error("key not representable in history repository: {reason}")]
    InvalidKey { reason: String },

    /// A git operation failed.
    #[error("git operation failed: {reason}")]
    Git { reason: String },
}

impl From<git2::Error> for RevisionError {
    fn from(err: git2::Error) -> Self {
        Self::Git {
            reason: err.message().to_owned(),
        }
    }
}
