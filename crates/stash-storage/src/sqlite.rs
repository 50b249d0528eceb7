//! SQLite store.
//!
//! SQLite is a single-writer database: all mutations take an exclusive
//! application-level lock, reads take it shared. The lock wraps the pool, so
//! a write statement never interleaves with another mutation — which is what
//! makes the two-statement upsert/conditional-update sequences below safe.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::RwLock;

use crate::{
    AuditQuery, AuditRow, KvMeta, KvRow, ListFilter, NewAuditRow, SessionRow, StorageError, Store,
    VersionedUpdate, like_escape, to_millis,
};

/// SQL predicate matching keys on a secrets path.
const SECRETS_PRED: &str = "(key = 'secrets' OR key LIKE 'secrets/%' \
     OR key LIKE '%/secrets' OR key LIKE '%/secrets/%')";

/// A [`Store`] backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Writers exclusive, readers shared.
    lock: RwLock<()>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if necessary) a SQLite database and run the initial
    /// migration.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened or the
    /// migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Open {
                url: database_url.to_owned(),
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open {
                url: database_url.to_owned(),
                reason: e.to_string(),
            })?;

        for ddl in MIGRATIONS {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Open {
                    url: database_url.to_owned(),
                    reason: format!("migration failed: {e}"),
                })?;
        }

        Ok(Self {
            pool,
            lock: RwLock::new(()),
        })
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv (\
        key        TEXT    PRIMARY KEY, \
        value      BLOB    NOT NULL, \
        format     TEXT    NOT NULL, \
        created_at INTEGER NOT NULL, \
        updated_at INTEGER NOT NULL\
     )",
    "CREATE INDEX IF NOT EXISTS idx_kv_updated ON kv (updated_at DESC, key ASC)",
    "CREATE TABLE IF NOT EXISTS sessions (\
        token      TEXT    PRIMARY KEY, \
        username   TEXT    NOT NULL, \
        created_at INTEGER NOT NULL, \
        expires_at INTEGER NOT NULL\
     )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions (username)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions (expires_at)",
    "CREATE TABLE IF NOT EXISTS audit_log (\
        id          INTEGER PRIMARY KEY AUTOINCREMENT, \
        ts          INTEGER NOT NULL, \
        action      TEXT    NOT NULL, \
        key         TEXT    NOT NULL, \
        actor       TEXT    NOT NULL, \
        actor_type  TEXT    NOT NULL, \
        result      TEXT    NOT NULL, \
        ip          TEXT    NOT NULL, \
        user_agent  TEXT    NOT NULL, \
        request_id  TEXT    NOT NULL, \
        value_size  INTEGER\
     )",
    "CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log (ts DESC, id DESC)",
];

fn decode_ts(key: &str, millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StorageError::Corrupt {
        key: key.to_owned(),
        reason: format!("timestamp {millis} out of range"),
    })
}

fn push_audit_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &AuditQuery) {
    qb.push(" WHERE 1=1");
    if let Some(ref key) = query.key {
        match key.strip_suffix('*') {
            Some(prefix) => {
                qb.push(" AND key LIKE ")
                    .push_bind(format!("{}%", like_escape(prefix)))
                    .push(" ESCAPE '\\'");
            }
            None => {
                qb.push(" AND key = ").push_bind(key.clone());
            }
        }
    }
    if let Some(ref actor) = query.actor {
        qb.push(" AND actor = ").push_bind(actor.clone());
    }
    if let Some(ref actor_type) = query.actor_type {
        qb.push(" AND actor_type = ").push_bind(actor_type.clone());
    }
    if let Some(ref action) = query.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(ref result) = query.result {
        qb.push(" AND result = ").push_bind(result.clone());
    }
    if let Some(from) = query.from {
        qb.push(" AND ts >= ").push_bind(from.timestamp_millis());
    }
    if let Some(to) = query.to {
        qb.push(" AND ts <= ").push_bind(to.timestamp_millis());
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn kv_get(&self, key: &str) -> Result<Option<KvRow>, StorageError> {
        let _guard = self.lock.read().await;
        let row: Option<(Vec<u8>, String, i64, i64)> = sqlx::query_as(
            "SELECT value, format, created_at, updated_at FROM kv WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        match row {
            None => Ok(None),
            Some((value, format, created, updated)) => Ok(Some(KvRow {
                key: key.to_owned(),
                value,
                format,
                created_at: decode_ts(key, created)?,
                updated_at: decode_ts(key, updated)?,
            })),
        }
    }

    async fn kv_upsert(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let _guard = self.lock.write().await;
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM kv WHERE key = ?)")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        // An update advances updated_at to at least one millisecond past the
        // previous value, so a stale optimistic reader always conflicts.
        sqlx::query(
            "INSERT INTO kv (key, value, format, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET \
                value = excluded.value, \
                format = excluded.format, \
                updated_at = MAX(excluded.updated_at, kv.updated_at + 1)",
        )
        .bind(key)
        .bind(value)
        .bind(format)
        .bind(to_millis(now).timestamp_millis())
        .bind(to_millis(now).timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(!exists)
    }

    async fn kv_update_if(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<VersionedUpdate, StorageError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query(
            "UPDATE kv SET value = ?, format = ?, \
                updated_at = MAX(?, updated_at + 1) \
             WHERE key = ? AND updated_at = ?",
        )
        .bind(value)
        .bind(format)
        .bind(to_millis(now).timestamp_millis())
        .bind(key)
        .bind(expected_updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        if result.rows_affected() > 0 {
            return Ok(VersionedUpdate::Applied);
        }

        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM kv WHERE key = ?)")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(if exists {
            VersionedUpdate::Conflict
        } else {
            VersionedUpdate::Missing
        })
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(result.rows_affected() > 0)
    }

    async fn kv_list(
        &self,
        prefix: Option<&str>,
        filter: ListFilter,
    ) -> Result<Vec<KvMeta>, StorageError> {
        let _guard = self.lock.read().await;
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT key, length(value), format, \
             (substr(value, 1, 4) = x'245a4b24'), \
             created_at, updated_at FROM kv WHERE 1=1",
        );
        if let Some(prefix) = prefix {
            qb.push(" AND key LIKE ")
                .push_bind(format!("{}%", like_escape(prefix)))
                .push(" ESCAPE '\\'");
        }
        match filter {
            ListFilter::All => {}
            ListFilter::SecretsOnly => {
                qb.push(" AND ").push(SECRETS_PRED);
            }
            ListFilter::KeysOnly => {
                qb.push(" AND NOT ").push(SECRETS_PRED);
            }
        }
        qb.push(" ORDER BY updated_at DESC, key ASC");

        let rows: Vec<(String, i64, String, bool, i64, i64)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::List {
                scope: prefix.unwrap_or("").to_owned(),
                reason: e.to_string(),
            })?;

        rows.into_iter()
            .map(|(key, size, format, zk, created, updated)| {
                Ok(KvMeta {
                    size: u64::try_from(size).unwrap_or(0),
                    format,
                    zk,
                    created_at: decode_ts(&key, created)?,
                    updated_at: decode_ts(&key, updated)?,
                    key,
                })
            })
            .collect()
    }

    async fn session_insert(&self, session: &SessionRow) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        sqlx::query(
            "INSERT INTO sessions (token, username, created_at, expires_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (token) DO UPDATE SET \
                username = excluded.username, expires_at = excluded.expires_at",
        )
        .bind(&session.token)
        .bind(&session.username)
        .bind(to_millis(session.created_at).timestamp_millis())
        .bind(to_millis(session.expires_at).timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: "sessions".to_owned(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn session_get(&self, token: &str) -> Result<Option<SessionRow>, StorageError> {
        let _guard = self.lock.read().await;
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT username, created_at, expires_at FROM sessions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Read {
            key: "sessions".to_owned(),
            reason: e.to_string(),
        })?;

        match row {
            None => Ok(None),
            Some((username, created, expires)) => Ok(Some(SessionRow {
                token: token.to_owned(),
                username,
                created_at: decode_ts("sessions", created)?,
                expires_at: decode_ts("sessions", expires)?,
            })),
        }
    }

    async fn session_delete(&self, token: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: "sessions".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn session_delete_for_user(&self, username: &str) -> Result<u64, StorageError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query("DELETE FROM sessions WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: "sessions".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(result.rows_affected())
    }

    async fn session_delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: "sessions".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(result.rows_affected())
    }

    async fn audit_insert(&self, entry: &NewAuditRow) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        sqlx::query(
            "INSERT INTO audit_log \
             (ts, action, key, actor, actor_type, result, ip, user_agent, request_id, value_size) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(to_millis(entry.timestamp).timestamp_millis())
        .bind(&entry.action)
        .bind(&entry.key)
        .bind(&entry.actor)
        .bind(&entry.actor_type)
        .bind(&entry.result)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(&entry.request_id)
        .bind(entry.value_size.and_then(|s| i64::try_from(s).ok()))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: entry.key.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn audit_query(&self, query: &AuditQuery) -> Result<(Vec<AuditRow>, u64), StorageError> {
        let _guard = self.lock.read().await;
        let mut count_qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM audit_log");
        push_audit_filters(&mut count_qb, query);
        let (total,): (i64,) = count_qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Read {
                key: "audit_log".to_owned(),
                reason: e.to_string(),
            })?;

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT id, ts, action, key, actor, actor_type, result, ip, user_agent, \
             request_id, value_size FROM audit_log",
        );
        push_audit_filters(&mut qb, query);
        qb.push(" ORDER BY ts DESC, id DESC LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));

        type Row = (
            i64,
            i64,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            Option<i64>,
        );
        let rows: Vec<Row> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Read {
                key: "audit_log".to_owned(),
                reason: e.to_string(),
            })?;

        let entries = rows
            .into_iter()
            .map(
                |(id, ts, action, key, actor, actor_type, result, ip, user_agent, request_id, size)| {
                    Ok(AuditRow {
                        id,
                        timestamp: decode_ts(&key, ts)?,
                        action,
                        actor,
                        actor_type,
                        result,
                        ip,
                        user_agent,
                        request_id,
                        value_size: size.and_then(|s| u64::try_from(s).ok()),
                        key,
                    })
                },
            )
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok((entries, u64::try_from(total).unwrap_or(0)))
    }

    async fn audit_delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let _guard = self.lock.write().await;
        let result = sqlx::query("DELETE FROM audit_log WHERE ts < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: "audit_log".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(result.rows_affected())
    }
}
