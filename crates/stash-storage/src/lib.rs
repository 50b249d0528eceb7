//! Relational persistence layer for Stash.
//!
//! This crate defines the [`Store`] trait — row-level operations for the
//! three persisted aggregates (`kv`, `sessions`, `audit_log`) — and three
//! implementations:
//!
//! - [`PostgresStore`] — multi-writer, relies on MVCC for write ordering
//! - [`SqliteStore`] — single-writer, serialized by an application-level
//!   reader-writer lock
//! - [`MemoryStore`] — in-memory, for tests
//!
//! The store knows nothing about encryption, permissions, or caching: values
//! are opaque bytes (secrets arrive here already encrypted), and the derived
//! `secret`/`zk` flags are computed from the key and the stored byte prefix
//! so listings never fetch payloads.
//!
//! Timestamps cross this boundary as [`chrono::DateTime<Utc>`] and are
//! persisted as integer milliseconds; optimistic-lock comparison is
//! millisecond equality.

mod error;
mod memory;
mod postgres;
mod sqlite;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

/// Leading bytes of a zero-knowledge envelope. Stored values beginning with
/// this prefix are flagged `zk` in listings.
pub const ZK_PREFIX: &[u8; 4] = b"$ZK$";

/// A full key row: payload plus metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRow {
    /// Normalized key.
    pub key: String,
    /// Opaque value bytes (ciphertext for secrets paths).
    pub value: Vec<u8>,
    /// Format hint, stored verbatim.
    pub format: String,
    /// Creation time (millisecond precision).
    pub created_at: DateTime<Utc>,
    /// Last update time (millisecond precision).
    pub updated_at: DateTime<Utc>,
}

/// Metadata projection of a key row, as returned by listings.
///
/// `size` is the on-disk byte size, and `zk` reflects whether the stored
/// bytes begin with [`ZK_PREFIX`]; neither requires fetching the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvMeta {
    /// Normalized key.
    pub key: String,
    /// On-disk byte size of the value.
    pub size: u64,
    /// Format hint.
    pub format: String,
    /// Whether the stored bytes begin with the ZK envelope prefix.
    pub zk: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Listing filter, resolved at the storage layer.
///
/// The secret / non-secret split is computed from the key's path segments,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFilter {
    /// Every key.
    #[default]
    All,
    /// Only keys on a secrets path.
    SecretsOnly,
    /// Only keys not on a secrets path.
    KeysOnly,
}

/// Outcome of a versioned (optimistic-lock) update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedUpdate {
    /// The row matched the expected version and was updated.
    Applied,
    /// The row exists but `updated_at` did not match; nothing was touched.
    Conflict,
    /// No row with that key exists.
    Missing,
}

/// A persisted login session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    /// 128-bit random identifier, hex-encoded.
    pub token: String,
    /// Owning user.
    pub username: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; always after `created_at`.
    pub expires_at: DateTime<Utc>,
}

/// An audit entry as stored (id assigned by the store).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    /// Auto-incrementing entry id.
    pub id: i64,
    /// When the request completed.
    pub timestamp: DateTime<Utc>,
    /// One of `read`, `create`, `update`, `delete`.
    pub action: String,
    /// The key the request addressed.
    pub key: String,
    /// Username, masked token, or `public`.
    pub actor: String,
    /// One of `user`, `token`, `public`.
    pub actor_type: String,
    /// One of `success`, `denied`, `notFound`.
    pub result: String,
    /// Client IP.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
    /// Per-request correlation id.
    pub request_id: String,
    /// Body size for successful reads and writes.
    pub value_size: Option<u64>,
}

/// An audit entry about to be inserted (no id yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditRow {
    /// When the request completed.
    pub timestamp: DateTime<Utc>,
    /// One of `read`, `create`, `update`, `delete`.
    pub action: String,
    /// The key the request addressed.
    pub key: String,
    /// Username, masked token, or `public`.
    pub actor: String,
    /// One of `user`, `token`, `public`.
    pub actor_type: String,
    /// One of `success`, `denied`, `notFound`.
    pub result: String,
    /// Client IP.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
    /// Per-request correlation id.
    pub request_id: String,
    /// Body size for successful reads and writes.
    pub value_size: Option<u64>,
}

/// Structured audit query. All fields are conjunctive; `None` means "any".
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Exact key, or a prefix when the value ends with `*`.
    pub key: Option<String>,
    /// Exact actor match.
    pub actor: Option<String>,
    /// Exact actor type match.
    pub actor_type: Option<String>,
    /// Exact action match.
    pub action: Option<String>,
    /// Exact result match.
    pub result: Option<String>,
    /// Inclusive lower time bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper time bound.
    pub to: Option<DateTime<Utc>>,
    /// Rows to skip (paging).
    pub offset: u64,
    /// Maximum rows to return; callers clamp before reaching the store.
    pub limit: u64,
}

/// Row-level persistence for the Stash aggregates.
///
/// Implementations must be safe to share across async tasks. Single-writer
/// backends serialize mutations internally; multi-writer backends rely on
/// the database's MVCC commit ordering.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch a key row including its payload.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend fails.
    async fn kv_get(&self, key: &str) -> Result<Option<KvRow>, StorageError>;

    /// Unconditional upsert. Creation sets `created_at == updated_at == now`;
    /// update advances `updated_at` only, and always to at least one
    /// millisecond past its previous value so the version seen by an
    /// optimistic reader can never survive an interleaved write.
    ///
    /// Returns `true` when the key was created, `false` when updated.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend fails.
    async fn kv_upsert(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Conditional update: applied only when the row's `updated_at` equals
    /// `expected_updated_at` at millisecond precision. A mismatch leaves the
    /// row untouched. Like [`kv_upsert`](Store::kv_upsert), an applied
    /// update strictly advances `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend fails.
    async fn kv_update_if(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<VersionedUpdate, StorageError>;

    /// Delete a key row. Returns `true` when a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the backend fails.
    async fn kv_delete(&self, key: &str) -> Result<bool, StorageError>;

    /// List key metadata, optionally narrowed to a key prefix, ordered by
    /// `updated_at DESC, key ASC`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the backend fails.
    async fn kv_list(
        &self,
        prefix: Option<&str>,
        filter: ListFilter,
    ) -> Result<Vec<KvMeta>, StorageError>;

    /// Persist a new session.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend fails.
    async fn session_insert(&self, session: &SessionRow) -> Result<(), StorageError>;

    /// Fetch a session by token. Returns `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend fails.
    async fn session_get(&self, token: &str) -> Result<Option<SessionRow>, StorageError>;

    /// Delete a session by token. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the backend fails.
    async fn session_delete(&self, token: &str) -> Result<(), StorageError>;

    /// Delete every session belonging to a user. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the backend fails.
    async fn session_delete_for_user(&self, username: &str) -> Result<u64, StorageError>;

    /// Delete sessions whose expiry is at or before `now`. Returns the count
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the backend fails.
    async fn session_delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Append an audit entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend fails.
    async fn audit_insert(&self, entry: &NewAuditRow) -> Result<(), StorageError>;

    /// Query audit entries newest-first. Returns the page plus the total
    /// number of matching rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend fails.
    async fn audit_query(&self, query: &AuditQuery) -> Result<(Vec<AuditRow>, u64), StorageError>;

    /// Delete audit entries older than `cutoff`. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the backend fails.
    async fn audit_delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Whether a normalized key lies on a secrets path: the key equals
/// `secrets` or contains `secrets` as a `/`-separated segment.
#[must_use]
pub fn is_secrets_key(key: &str) -> bool {
    key == "secrets"
        || key.starts_with("secrets/")
        || key.ends_with("/secrets")
        || key.contains("/secrets/")
}

/// Escape `%`, `_`, and `\` for a `LIKE ... ESCAPE '\'` pattern.
#[must_use]
pub(crate) fn like_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Truncate a timestamp to millisecond precision, the resolution stored on
/// disk. `DateTime::from_timestamp_millis` only fails outside the
/// representable range, which a value obtained from a valid `DateTime`
/// never is.
#[must_use]
pub fn to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
