//! PostgreSQL store.
//!
//! Multi-writer: concurrent mutations are ordered by the database's MVCC
//! commit order, so no application-level lock is taken. All three aggregate
//! tables are created on connect.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    AuditQuery, AuditRow, KvMeta, KvRow, ListFilter, NewAuditRow, SessionRow, StorageError, Store,
    VersionedUpdate, like_escape, to_millis,
};

/// SQL predicate matching keys on a secrets path.
const SECRETS_PRED: &str = "(key = 'secrets' OR key LIKE 'secrets/%' \
     OR key LIKE '%/secrets' OR key LIKE '%/secrets/%')";

/// A [`Store`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect to PostgreSQL and run the initial migration.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                url: redact_url(database_url),
                reason: e.to_string(),
            })?;

        for ddl in MIGRATIONS {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Open {
                    url: redact_url(database_url),
                    reason: format!("migration failed: {e}"),
                })?;
        }

        Ok(Self { pool })
    }
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv (\
        key        TEXT   PRIMARY KEY, \
        value      BYTEA  NOT NULL, \
        format     TEXT   NOT NULL, \
        created_at BIGINT NOT NULL, \
        updated_at BIGINT NOT NULL\
     )",
    "CREATE INDEX IF NOT EXISTS idx_kv_updated ON kv (updated_at DESC, key ASC)",
    "CREATE TABLE IF NOT EXISTS sessions (\
        token      TEXT   PRIMARY KEY, \
        username   TEXT   NOT NULL, \
        created_at BIGINT NOT NULL, \
        expires_at BIGINT NOT NULL\
     )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions (username)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions (expires_at)",
    "CREATE TABLE IF NOT EXISTS audit_log (\
        id          BIGSERIAL PRIMARY KEY, \
        ts          BIGINT NOT NULL, \
        action      TEXT   NOT NULL, \
        key         TEXT   NOT NULL, \
        actor       TEXT   NOT NULL, \
        actor_type  TEXT   NOT NULL, \
        result      TEXT   NOT NULL, \
        ip          TEXT   NOT NULL, \
        user_agent  TEXT   NOT NULL, \
        request_id  TEXT   NOT NULL, \
        value_size  BIGINT\
     )",
    "CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log (ts DESC, id DESC)",
];

/// Strip credentials from a connection URL before it lands in an error.
fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((scheme_and_creds, rest)) => match scheme_and_creds.split_once("//") {
            Some((scheme, _)) => format!("{scheme}//[redacted]@{rest}"),
            None => format!("[redacted]@{rest}"),
        },
        None => url.to_owned(),
    }
}

fn decode_ts(key: &str, millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StorageError::Corrupt {
        key: key.to_owned(),
        reason: format!("timestamp {millis} out of range"),
    })
}

fn decode_size(key: &str, size: i64) -> Result<u64, StorageError> {
    u64::try_from(size).map_err(|_| StorageError::Corrupt {
        key: key.to_owned(),
        reason: format!("negative size {size}"),
    })
}

fn push_audit_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &AuditQuery) {
    qb.push(" WHERE TRUE");
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
impl Store for PostgresStore {
    async fn kv_get(&self, key: &str) -> Result<Option<KvRow>, StorageError> {
        let row: Option<(Vec<u8>, String, i64, i64)> = sqlx::query_as(
            "SELECT value, format, created_at, updated_at FROM kv WHERE key = $1",
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
        // xmax = 0 identifies a freshly inserted row (vs. a conflict-update).
        // An update advances updated_at to at least one millisecond past the
        // previous value, so a stale optimistic reader always conflicts.
        let (created,): (bool,) = sqlx::query_as(
            "INSERT INTO kv (key, value, format, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) \
             ON CONFLICT (key) DO UPDATE SET \
                value = EXCLUDED.value, \
                format = EXCLUDED.format, \
                updated_at = GREATEST(EXCLUDED.updated_at, kv.updated_at + 1) \
             RETURNING (xmax = 0) AS created",
        )
        .bind(key)
        .bind(value)
        .bind(format)
        .bind(to_millis(now).timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(created)
    }

    async fn kv_update_if(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<VersionedUpdate, StorageError> {
        let result = sqlx::query(
            "UPDATE kv SET value = $2, format = $3, \
                updated_at = GREATEST($4, updated_at + 1) \
             WHERE key = $1 AND updated_at = $5",
        )
        .bind(key)
        .bind(value)
        .bind(format)
        .bind(to_millis(now).timestamp_millis())
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
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM kv WHERE key = $1)")
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
        let result = sqlx::query("DELETE FROM kv WHERE key = $1")
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
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT key, octet_length(value)::BIGINT, format, \
             (substring(value from 1 for 4) = '\\x245a4b24'::bytea), \
             created_at, updated_at FROM kv WHERE TRUE",
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
                    size: decode_size(&key, size)?,
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
        sqlx::query(
            "INSERT INTO sessions (token, username, created_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (token) DO UPDATE SET \
                username = EXCLUDED.username, expires_at = EXCLUDED.expires_at",
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
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT username, created_at, expires_at FROM sessions WHERE token = $1",
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
        sqlx::query("DELETE FROM sessions WHERE token = $1")
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
        let result = sqlx::query("DELETE FROM sessions WHERE username = $1")
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
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
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
        sqlx::query(
            "INSERT INTO audit_log \
             (ts, action, key, actor, actor_type, result, ip, user_agent, request_id, value_size) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
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
        let mut count_qb: QueryBuilder<'_, Postgres> =
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

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
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
        let result = sqlx::query("DELETE FROM audit_log WHERE ts < $1")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_url_strips_credentials() {
        assert_eq!(
            redact_url("postgres://user:pw@db.example/stash"),
            "postgres://[redacted]@db.example/stash"
        );
        assert_eq!(redact_url("postgres://localhost/stash"), "postgres://localhost/stash");
    }
}
