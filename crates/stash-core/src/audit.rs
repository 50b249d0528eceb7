//! Audit log.
//!
//! Entries are captured by the HTTP middleware after the handler completes
//! and written asynchronously — an audit failure is logged, never surfaced
//! to the client. Queries are structured (no free text) and clamped to a
//! configured page-size ceiling; a background sweeper enforces the
//! retention window.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use stash_storage::{AuditQuery, NewAuditRow, Store};
use tracing::{info, warn};

use crate::error::AuditError;

/// What a request did to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Value or metadata read.
    Read,
    /// Key created.
    Create,
    /// Key updated.
    Update,
    /// Key deleted.
    Delete,
}

impl AuditAction {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for AuditAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

/// How the request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditResult {
    /// 2xx.
    #[serde(rename = "success")]
    Success,
    /// 401 or 403.
    #[serde(rename = "denied")]
    Denied,
    /// 404 and anything else.
    #[serde(rename = "notFound")]
    NotFound,
}

impl AuditResult {
    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::NotFound => "notFound",
        }
    }
}

impl FromStr for AuditResult {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "denied" => Ok(Self::Denied),
            "notFound" => Ok(Self::NotFound),
            _ => Err(()),
        }
    }
}

/// The kind of principal behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// Named user.
    User,
    /// Named token.
    Token,
    /// The public principal.
    Public,
}

impl ActorKind {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Token => "token",
            Self::Public => "public",
        }
    }
}

impl FromStr for ActorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "token" => Ok(Self::Token),
            "public" => Ok(Self::Public),
            _ => Err(()),
        }
    }
}

/// One captured request, ready to be persisted.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Derived from the HTTP method and status.
    pub action: AuditAction,
    /// The normalized key the request addressed.
    pub key: String,
    /// Username, masked token, or `public`.
    pub actor: String,
    /// Actor classification.
    pub actor_type: String,
    /// Derived from the response status.
    pub result: AuditResult,
    /// Client IP.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
    /// Per-request correlation id.
    pub request_id: String,
    /// Body size for successful reads and writes; absent otherwise.
    pub value_size: Option<u64>,
}

/// A persisted entry, as returned by queries. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Store-assigned id.
    pub id: i64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Action name.
    pub action: String,
    /// Addressed key.
    pub key: String,
    /// Actor name.
    pub actor: String,
    /// Actor type.
    pub actor_type: String,
    /// Outcome.
    pub result: String,
    /// Client IP.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
    /// Correlation id.
    pub request_id: String,
    /// Body size, when recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_size: Option<u64>,
}

/// Structured query filter, as posted to the query endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuditFilter {
    /// Exact key, or a prefix with a trailing `*`.
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Exact actor name.
    #[serde(default)]
    pub actor: Option<String>,
    /// `user`, `token`, or `public`.
    #[serde(default)]
    pub actor_type: Option<String>,
    /// `read`, `create`, `update`, or `delete`.
    #[serde(default)]
    pub action: Option<String>,
    /// `success`, `denied`, or `notFound`.
    #[serde(default)]
    pub result: Option<String>,
    /// Inclusive lower bound, epoch milliseconds.
    #[serde(default)]
    pub from: Option<i64>,
    /// Inclusive upper bound, epoch milliseconds.
    #[serde(default)]
    pub to: Option<i64>,
    /// Rows to skip.
    #[serde(default)]
    pub offset: u64,
    /// Page size; clamped to the configured maximum.
    #[serde(default)]
    pub limit: Option<u64>,
}

/// The audit log service.
pub struct AuditLog {
    store: Arc<dyn Store>,
    max_query_limit: u64,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("max_query_limit", &self.max_query_limit)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Create the service. `max_query_limit` caps query page sizes.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_query_limit: u64) -> Self {
        Self {
            store,
            max_query_limit,
        }
    }

    /// Persist one captured request. Failures are logged and swallowed —
    /// audit writes never fail the request they describe.
    pub async fn record(&self, record: AuditRecord) {
        let row = NewAuditRow {
            timestamp: Utc::now(),
            action: record.action.as_str().to_owned(),
            key: record.key,
            actor: record.actor,
            actor_type: record.actor_type,
            result: record.result.as_str().to_owned(),
            ip: record.ip,
            user_agent: record.user_agent,
            request_id: record.request_id,
            value_size: record.value_size,
        };
        if let Err(e) = self.store.audit_insert(&row).await {
            warn!(key = %row.key, error = %e, "audit write failed");
        }
    }

    /// Run a structured query. Returns `(entries, total_matching, limit)`
    /// where `limit` is the effective page size after clamping.
    ///
    /// # Errors
    ///
    /// [`AuditError::InvalidFilter`] for unknown enum values or
    /// out-of-range bounds, [`AuditError::Storage`] when the store fails.
    pub async fn query(
        &self,
        filter: &AuditFilter,
    ) -> Result<(Vec<AuditEntry>, u64, u64), AuditError> {
        let limit = filter
            .limit
            .unwrap_or(self.max_query_limit)
            .min(self.max_query_limit);

        let query = AuditQuery {
            key: filter.key_prefix.clone(),
            actor: filter.actor.clone(),
            actor_type: validate_enum::<ActorKind>("actorType", filter.actor_type.as_deref())?,
            action: validate_enum::<AuditAction>("action", filter.action.as_deref())?,
            result: validate_enum::<AuditResult>("result", filter.result.as_deref())?,
            from: convert_bound("from", filter.from)?,
            to: convert_bound("to", filter.to)?,
            offset: filter.offset,
            limit,
        };

        let (rows, total) = self.store.audit_query(&query).await?;
        let entries = rows
            .into_iter()
            .map(|row| AuditEntry {
                id: row.id,
                timestamp: row.timestamp.timestamp_millis(),
                action: row.action,
                key: row.key,
                actor: row.actor,
                actor_type: row.actor_type,
                result: row.result,
                ip: row.ip,
                user_agent: row.user_agent,
                request_id: row.request_id,
                value_size: row.value_size,
            })
            .collect();
        Ok((entries, total, limit))
    }

    /// Delete entries older than the retention window. A zero or negative
    /// window means unlimited retention and is a no-op.
    pub async fn sweep(&self, retention: TimeDelta) {
        if retention <= TimeDelta::zero() {
            return;
        }
        let cutoff = Utc::now() - retention;
        match self.store.audit_delete_before(cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "audit retention sweep"),
            Err(e) => warn!(error = %e, "audit retention sweep failed"),
        }
    }
}

fn validate_enum<T: FromStr>(
    field: &str,
    value: Option<&str>,
) -> Result<Option<String>, AuditError> {
    match value {
        None => Ok(None),
        Some(raw) => {
            T::from_str(raw).map_err(|_| AuditError::InvalidFilter {
                reason: format!("unknown {field} value '{raw}'"),
            })?;
            Ok(Some(raw.to_owned()))
        }
    }
}

fn convert_bound(field: &str, millis: Option<i64>) -> Result<Option<DateTime<Utc>>, AuditError> {
    match millis {
        None => Ok(None),
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| AuditError::InvalidFilter {
                reason: format!("{field} timestamp {ms} out of range"),
            }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stash_storage::MemoryStore;

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(MemoryStore::new()), 100)
    }

    fn record(key: &str, action: AuditAction, result: AuditResult) -> AuditRecord {
        AuditRecord {
            action,
            key: key.to_owned(),
            actor: "alice".to_owned(),
            actor_type: "user".to_owned(),
            result,
            ip: "127.0.0.1".to_owned(),
            user_agent: "curl".to_owned(),
            request_id: uuid::Uuid::new_v4().to_string(),
            value_size: Some(5),
        }
    }

    #[tokio::test]
    async fn record_then_query_roundtrip() {
        let log = log();
        log.record(record("app/cfg", AuditAction::Create, AuditResult::Success))
            .await;
        log.record(record("app/cfg", AuditAction::Read, AuditResult::Success))
            .await;

        let (entries, total, limit) = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(limit, 100);
        // Newest first.
        assert_eq!(entries[0].action, "read");
        assert_eq!(entries[1].action, "create");
    }

    #[tokio::test]
    async fn limit_is_clamped_to_configured_max() {
        let log = log();
        for _ in 0..3 {
            log.record(record("k", AuditAction::Read, AuditResult::Success))
                .await;
        }
        let (entries, total, limit) = log
            .query(&AuditFilter {
                limit: Some(100_000),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limit, 100);
        assert_eq!(total, 3);
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn filter_by_action_and_result() {
        let log = log();
        log.record(record("a", AuditAction::Create, AuditResult::Success))
            .await;
        log.record(record("b", AuditAction::Read, AuditResult::Denied))
            .await;

        let (entries, total, _) = log
            .query(&AuditFilter {
                result: Some("denied".to_owned()),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].key, "b");
    }

    #[tokio::test]
    async fn unknown_enum_values_are_rejected() {
        let log = log();
        for filter in [
            AuditFilter {
                action: Some("explode".to_owned()),
                ..AuditFilter::default()
            },
            AuditFilter {
                result: Some("maybe".to_owned()),
                ..AuditFilter::default()
            },
            AuditFilter {
                actor_type: Some("robot".to_owned()),
                ..AuditFilter::default()
            },
        ] {
            assert!(matches!(
                log.query(&filter).await,
                Err(AuditError::InvalidFilter { .. })
            ));
        }
    }

    #[tokio::test]
    async fn key_prefix_star_matches_subtree() {
        let log = log();
        log.record(record("app/a", AuditAction::Read, AuditResult::Success))
            .await;
        log.record(record("other/b", AuditAction::Read, AuditResult::Success))
            .await;

        let (_, total, _) = log
            .query(&AuditFilter {
                key_prefix: Some("app/*".to_owned()),
                ..AuditFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn zero_retention_is_unlimited() {
        let log = log();
        log.record(record("k", AuditAction::Read, AuditResult::Success))
            .await;
        log.sweep(TimeDelta::zero()).await;
        let (_, total, _) = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(total, 1);
    }
}
