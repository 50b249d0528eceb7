//! The transactional KV store.
//!
//! Wraps the persistence layer with the behavior the API relies on:
//!
//! - key normalization on every operation
//! - encryption at rest for secrets paths (when a master key is configured)
//! - optimistic locking via `set_with_version`
//! - the optional in-process cache, invalidated only after a write commits
//!
//! Write ordering is the store backend's concern: the single-writer lock
//! (SQLite) or MVCC commit order (PostgreSQL) totally orders writes per key.

use std::sync::Arc;

use chrono::Utc;
use stash_storage::{ListFilter, Store, VersionedUpdate, is_secrets_key, to_millis};

use crate::cache::{Value, ValueCache};
use crate::crypto::{self, MasterKey};
use crate::error::KvError;
use crate::key::{Format, normalize_key};
use crate::zk;

/// Metadata projection of a key, as served by listings and `get_info`.
///
/// `secret` and `zk_encrypted` are derived — from the key's path segments
/// and the stored byte prefix respectively. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    /// Normalized key.
    pub key: String,
    /// On-disk byte size (ciphertext size for secrets paths).
    pub size: u64,
    /// Format hint.
    pub format: Format,
    /// Whether the key lies on a secrets path.
    pub secret: bool,
    /// Whether the stored bytes begin with `$ZK$`.
    pub zk_encrypted: bool,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
}

/// The KV store. Cheap to clone via `Arc` fields.
pub struct KvStore {
    store: Arc<dyn Store>,
    cache: Option<ValueCache>,
    master_key: Option<MasterKey>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("cache", &self.cache.is_some())
            .field("secrets_enabled", &self.master_key.is_some())
            .finish_non_exhaustive()
    }
}

impl KvStore {
    /// Create a KV store over the given backend.
    ///
    /// `cache` enables the in-process value cache; `master_key` enables
    /// secrets encryption. Without a master key, writes to secrets paths
    /// fail with [`KvError::SecretsDisabled`].
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        cache: Option<ValueCache>,
        master_key: Option<MasterKey>,
    ) -> Self {
        Self {
            store,
            cache,
            master_key,
        }
    }

    /// Read a value.
    ///
    /// Secrets paths are decrypted when a master key is configured;
    /// otherwise the raw stored bytes are returned.
    ///
    /// # Errors
    ///
    /// [`KvError::NotFound`], [`KvError::Crypto`] when decryption fails,
    /// or [`KvError::Storage`].
    pub async fn get(&self, key: &str) -> Result<Value, KvError> {
        let key = normalize_key(key)?;
        match &self.cache {
            Some(cache) => cache.get_or_load(&key, self.load(key.clone())).await,
            None => self.load(key).await,
        }
    }

    /// Read a key's metadata without decrypting its value.
    ///
    /// # Errors
    ///
    /// [`KvError::NotFound`] or [`KvError::Storage`].
    pub async fn get_info(&self, key: &str) -> Result<KeyInfo, KvError> {
        let key = normalize_key(key)?;
        let row = self
            .store
            .kv_get(&key)
            .await?
            .ok_or_else(|| KvError::NotFound { key: key.clone() })?;

        Ok(KeyInfo {
            secret: is_secrets_key(&row.key),
            zk_encrypted: zk::is_zk(&row.value),
            size: row.value.len() as u64,
            format: parse_format(&row.key, &row.format)?,
            created_at: row.created_at.timestamp_millis(),
            updated_at: row.updated_at.timestamp_millis(),
            key: row.key,
        })
    }

    /// Unconditional upsert. Returns `true` when the key was created.
    ///
    /// # Errors
    ///
    /// [`KvError::SecretsDisabled`] for a secrets path without a master
    /// key, or [`KvError::Storage`].
    pub async fn set(&self, key: &str, value: &[u8], format: Format) -> Result<bool, KvError> {
        let key = normalize_key(key)?;
        let stored = self.encode_value(&key, value)?;
        let created = self
            .store
            .kv_upsert(&key, &stored, format.as_str(), to_millis(Utc::now()))
            .await?;
        self.invalidate(&key).await;
        Ok(created)
    }

    /// Conditional update: applied only when the row's `updated_at` still
    /// equals `expected_updated_at` (epoch milliseconds). This is the write
    /// path behind UI edit flows.
    ///
    /// # Errors
    ///
    /// [`KvError::Conflict`] on a version mismatch (the row is untouched),
    /// [`KvError::NotFound`], [`KvError::SecretsDisabled`], or
    /// [`KvError::Storage`].
    pub async fn set_with_version(
        &self,
        key: &str,
        value: &[u8],
        format: Format,
        expected_updated_at: i64,
    ) -> Result<(), KvError> {
        let key = normalize_key(key)?;
        let stored = self.encode_value(&key, value)?;
        let expected = chrono::DateTime::from_timestamp_millis(expected_updated_at)
            .ok_or_else(|| KvError::InvalidKey {
                reason: format!("expected version {expected_updated_at} out of range"),
            })?;

        let outcome = self
            .store
            .kv_update_if(&key, &stored, format.as_str(), expected, to_millis(Utc::now()))
            .await?;
        match outcome {
            VersionedUpdate::Applied => {
                self.invalidate(&key).await;
                Ok(())
            }
            VersionedUpdate::Conflict => Err(KvError::Conflict { key }),
            VersionedUpdate::Missing => Err(KvError::NotFound { key }),
        }
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// [`KvError::NotFound`] or [`KvError::Storage`].
    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        let key = normalize_key(key)?;
        if !self.store.kv_delete(&key).await? {
            return Err(KvError::NotFound { key });
        }
        self.invalidate(&key).await;
        Ok(())
    }

    /// List key metadata, ordered by `updated_at DESC, key ASC`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Storage`] if the backend fails.
    pub async fn list(
        &self,
        prefix: Option<&str>,
        filter: ListFilter,
    ) -> Result<Vec<KeyInfo>, KvError> {
        let rows = self.store.kv_list(prefix, filter).await?;
        rows.into_iter()
            .map(|meta| {
                Ok(KeyInfo {
                    secret: is_secrets_key(&meta.key),
                    zk_encrypted: meta.zk,
                    size: meta.size,
                    format: parse_format(&meta.key, &meta.format)?,
                    created_at: meta.created_at.timestamp_millis(),
                    updated_at: meta.updated_at.timestamp_millis(),
                    key: meta.key,
                })
            })
            .collect()
    }

    /// Whether secrets encryption is configured.
    #[must_use]
    pub fn secrets_enabled(&self) -> bool {
        self.master_key.is_some()
    }

    async fn load(&self, key: String) -> Result<Value, KvError> {
        let row = self
            .store
            .kv_get(&key)
            .await?
            .ok_or_else(|| KvError::NotFound { key: key.clone() })?;

        let bytes = match (&self.master_key, is_secrets_key(&key)) {
            (Some(master), true) => crypto::decrypt_record(master, &row.value)?,
            // No master key: serve the stored bytes as-is, readable or not.
            _ => row.value,
        };

        Ok(Value {
            bytes: Arc::new(bytes),
            format: parse_format(&key, &row.format)?,
        })
    }

    fn encode_value(&self, key: &str, value: &[u8]) -> Result<Vec<u8>, KvError> {
        if !is_secrets_key(key) {
            return Ok(value.to_vec());
        }
        match &self.master_key {
            Some(master) => Ok(crypto::encrypt_record(master, value)?),
            None => Err(KvError::SecretsDisabled {
                key: key.to_owned(),
            }),
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key).await;
        }
    }
}

fn parse_format(key: &str, stored: &str) -> Result<Format, KvError> {
    stored.parse().map_err(|_| {
        KvError::Storage(stash_storage::StorageError::Corrupt {
            key: key.to_owned(),
            reason: format!("unknown stored format '{stored}'"),
        })
    })
}
