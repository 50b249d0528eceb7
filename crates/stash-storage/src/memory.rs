//! In-memory store for testing.
//!
//! Keeps all three aggregates in plain collections behind a `RwLock`. Not
//! persistent — data is lost when the process exits. Use this in unit and
//! integration tests where a real store is needed without touching disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AuditQuery, AuditRow, KvMeta, KvRow, ListFilter, NewAuditRow, SessionRow, StorageError, Store,
    VersionedUpdate, is_secrets_key, to_millis, ZK_PREFIX,
};

#[derive(Debug, Default)]
struct Inner {
    kv: BTreeMap<String, KvRow>,
    sessions: HashMap<String, SessionRow>,
    audit: Vec<AuditRow>,
    next_audit_id: i64,
}

/// An in-memory [`Store`].
///
/// Clones share state, which lets a test hold a handle while the service
/// under test owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// An update must move `updated_at` strictly forward even within one
/// millisecond, or a stale optimistic reader could slip through.
fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let next = previous.timestamp_millis() + 1;
    if now.timestamp_millis() > previous.timestamp_millis() {
        now
    } else {
        DateTime::from_timestamp_millis(next).unwrap_or(now)
    }
}

fn meta_of(row: &KvRow) -> KvMeta {
    KvMeta {
        key: row.key.clone(),
        size: row.value.len() as u64,
        format: row.format.clone(),
        zk: row.value.starts_with(ZK_PREFIX),
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn audit_matches(row: &AuditRow, query: &AuditQuery) -> bool {
    if let Some(ref key) = query.key {
        match key.strip_suffix('*') {
            Some(prefix) => {
                if !row.key.starts_with(prefix) {
                    return false;
                }
            }
            None => {
                if row.key != *key {
                    return false;
                }
            }
        }
    }
    if query.actor.as_ref().is_some_and(|a| *a != row.actor) {
        return false;
    }
    if query
        .actor_type
        .as_ref()
        .is_some_and(|a| *a != row.actor_type)
    {
        return false;
    }
    if query.action.as_ref().is_some_and(|a| *a != row.action) {
        return false;
    }
    if query.result.as_ref().is_some_and(|r| *r != row.result) {
        return false;
    }
    if query.from.is_some_and(|from| row.timestamp < from) {
        return false;
    }
    if query.to.is_some_and(|to| row.timestamp > to) {
        return false;
    }
    true
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn kv_get(&self, key: &str) -> Result<Option<KvRow>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).cloned())
    }

    async fn kv_upsert(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let now = to_millis(now);
        let mut inner = self.inner.write().await;
        match inner.kv.get_mut(key) {
            Some(row) => {
                row.value = value.to_vec();
                row.format = format.to_owned();
                row.updated_at = advance(row.updated_at, now);
                Ok(false)
            }
            None => {
                inner.kv.insert(
                    key.to_owned(),
                    KvRow {
                        key: key.to_owned(),
                        value: value.to_vec(),
                        format: format.to_owned(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn kv_update_if(
        &self,
        key: &str,
        value: &[u8],
        format: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<VersionedUpdate, StorageError> {
        let now = to_millis(now);
        let mut inner = self.inner.write().await;
        let Some(row) = inner.kv.get_mut(key) else {
            return Ok(VersionedUpdate::Missing);
        };
        if row.updated_at.timestamp_millis() != expected_updated_at.timestamp_millis() {
            return Ok(VersionedUpdate::Conflict);
        }
        row.value = value.to_vec();
        row.format = format.to_owned();
        row.updated_at = advance(row.updated_at, now);
        Ok(VersionedUpdate::Applied)
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        Ok(inner.kv.remove(key).is_some())
    }

    async fn kv_list(
        &self,
        prefix: Option<&str>,
        filter: ListFilter,
    ) -> Result<Vec<KvMeta>, StorageError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<KvMeta> = inner
            .kv
            .values()
            .filter(|row| prefix.is_none_or(|p| row.key.starts_with(p)))
            .filter(|row| match filter {
                ListFilter::All => true,
                ListFilter::SecretsOnly => is_secrets_key(&row.key),
                ListFilter::KeysOnly => !is_secrets_key(&row.key),
            })
            .map(meta_of)
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(rows)
    }

    async fn session_insert(&self, session: &SessionRow) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let mut stored = session.clone();
        stored.created_at = to_millis(stored.created_at);
        stored.expires_at = to_millis(stored.expires_at);
        inner.sessions.insert(stored.token.clone(), stored);
        Ok(())
    }

    async fn session_get(&self, token: &str) -> Result<Option<SessionRow>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(token).cloned())
    }

    async fn session_delete(&self, token: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(token);
        Ok(())
    }

    async fn session_delete_for_user(&self, username: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.username != username);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn session_delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn audit_insert(&self, entry: &NewAuditRow) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.next_audit_id += 1;
        let id = inner.next_audit_id;
        inner.audit.push(AuditRow {
            id,
            timestamp: to_millis(entry.timestamp),
            action: entry.action.clone(),
            key: entry.key.clone(),
            actor: entry.actor.clone(),
            actor_type: entry.actor_type.clone(),
            result: entry.result.clone(),
            ip: entry.ip.clone(),
            user_agent: entry.user_agent.clone(),
            request_id: entry.request_id.clone(),
            value_size: entry.value_size,
        });
        Ok(())
    }

    async fn audit_query(&self, query: &AuditQuery) -> Result<(Vec<AuditRow>, u64), StorageError> {
        let inner = self.inner.read().await;
        let mut matched: Vec<AuditRow> = inner
            .audit
            .iter()
            .filter(|row| audit_matches(row, query))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(usize::try_from(query.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(query.limit).unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }

    async fn audit_delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut inner = self.inner.write().await;
        let before = inner.audit.len();
        inner.audit.retain(|row| row.timestamp >= cutoff);
        Ok((before - inner.audit.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        to_millis(Utc::now())
    }

    #[tokio::test]
    async fn kv_get_nonexistent_returns_none() {
        let store = MemoryStore::new();
        assert_eq!(store.kv_get("does/not/exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_upsert_reports_created_then_updated() {
        let store = MemoryStore::new();
        let t = now();
        assert!(store.kv_upsert("app/cfg", b"v1", "text", t).await.unwrap());
        assert!(!store.kv_upsert("app/cfg", b"v2", "text", t).await.unwrap());
        let row = store.kv_get("app/cfg").await.unwrap().unwrap();
        assert_eq!(row.value, b"v2");
    }

    #[tokio::test]
    async fn kv_create_sets_equal_timestamps_update_advances_one() {
        let store = MemoryStore::new();
        let t0 = now();
        store.kv_upsert("k", b"a", "text", t0).await.unwrap();
        let created = store.kv_get("k").await.unwrap().unwrap();
        assert_eq!(created.created_at, created.updated_at);

        let t1 = t0 + TimeDelta::milliseconds(5);
        store.kv_upsert("k", b"b", "text", t1).await.unwrap();
        let updated = store.kv_get("k").await.unwrap().unwrap();
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.updated_at, t1);
    }

    #[tokio::test]
    async fn kv_same_millisecond_update_still_advances_version() {
        let store = MemoryStore::new();
        let t = now();
        store.kv_upsert("k", b"a", "text", t).await.unwrap();
        store.kv_upsert("k", b"b", "text", t).await.unwrap();
        let row = store.kv_get("k").await.unwrap().unwrap();
        assert!(row.updated_at > row.created_at);

        // A reader who saw the first version must now conflict.
        let outcome = store.kv_update_if("k", b"c", "text", t, t).await.unwrap();
        assert_eq!(outcome, VersionedUpdate::Conflict);
    }

    #[tokio::test]
    async fn kv_update_if_applies_on_match() {
        let store = MemoryStore::new();
        let t0 = now();
        store.kv_upsert("k", b"a", "text", t0).await.unwrap();
        let t1 = t0 + TimeDelta::milliseconds(1);
        let outcome = store
            .kv_update_if("k", b"b", "json", t0, t1)
            .await
            .unwrap();
        assert_eq!(outcome, VersionedUpdate::Applied);
        let row = store.kv_get("k").await.unwrap().unwrap();
        assert_eq!(row.value, b"b");
        assert_eq!(row.format, "json");
    }

    #[tokio::test]
    async fn kv_update_if_conflicts_on_stale_version() {
        let store = MemoryStore::new();
        let t0 = now();
        store.kv_upsert("k", b"a", "text", t0).await.unwrap();
        let t1 = t0 + TimeDelta::milliseconds(1);
        store.kv_upsert("k", b"b", "text", t1).await.unwrap();

        let outcome = store
            .kv_update_if("k", b"c", "text", t0, t1 + TimeDelta::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(outcome, VersionedUpdate::Conflict);
        // Row untouched.
        let row = store.kv_get("k").await.unwrap().unwrap();
        assert_eq!(row.value, b"b");
    }

    #[tokio::test]
    async fn kv_update_if_missing_key() {
        let store = MemoryStore::new();
        let t = now();
        let outcome = store.kv_update_if("nope", b"x", "text", t, t).await.unwrap();
        assert_eq!(outcome, VersionedUpdate::Missing);
    }

    #[tokio::test]
    async fn kv_delete_reports_existence() {
        let store = MemoryStore::new();
        store.kv_upsert("k", b"v", "text", now()).await.unwrap();
        assert!(store.kv_delete("k").await.unwrap());
        assert!(!store.kv_delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn kv_list_orders_by_updated_desc_then_key() {
        let store = MemoryStore::new();
        let t0 = now();
        let t1 = t0 + TimeDelta::milliseconds(10);
        store.kv_upsert("b", b"1", "text", t1).await.unwrap();
        store.kv_upsert("a", b"1", "text", t1).await.unwrap();
        store.kv_upsert("c", b"1", "text", t0).await.unwrap();

        let keys: Vec<String> = store
            .kv_list(None, ListFilter::All)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn kv_list_filters_secrets() {
        let store = MemoryStore::new();
        let t = now();
        store.kv_upsert("app/cfg", b"1", "text", t).await.unwrap();
        store
            .kv_upsert("secrets/db", b"2", "text", t)
            .await
            .unwrap();

        let secrets = store.kv_list(None, ListFilter::SecretsOnly).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].key, "secrets/db");

        let plain = store.kv_list(None, ListFilter::KeysOnly).await.unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].key, "app/cfg");
    }

    #[tokio::test]
    async fn kv_list_prefix_narrows() {
        let store = MemoryStore::new();
        let t = now();
        store.kv_upsert("app/a", b"1", "text", t).await.unwrap();
        store.kv_upsert("other/b", b"1", "text", t).await.unwrap();

        let rows = store.kv_list(Some("app/"), ListFilter::All).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "app/a");
    }

    #[tokio::test]
    async fn kv_meta_reports_size_and_zk() {
        let store = MemoryStore::new();
        let t = now();
        store.kv_upsert("plain", b"hello", "text", t).await.unwrap();
        store
            .kv_upsert("wrapped", b"$ZK$abcd", "text", t)
            .await
            .unwrap();

        let rows = store.kv_list(None, ListFilter::All).await.unwrap();
        let plain = rows.iter().find(|m| m.key == "plain").unwrap();
        assert_eq!(plain.size, 5);
        assert!(!plain.zk);
        let wrapped = rows.iter().find(|m| m.key == "wrapped").unwrap();
        assert!(wrapped.zk);
    }

    #[tokio::test]
    async fn session_roundtrip_and_user_invalidation() {
        let store = MemoryStore::new();
        let t = now();
        for (token, user) in [("t1", "alice"), ("t2", "alice"), ("t3", "bob")] {
            store
                .session_insert(&SessionRow {
                    token: token.to_owned(),
                    username: user.to_owned(),
                    created_at: t,
                    expires_at: t + TimeDelta::hours(1),
                })
                .await
                .unwrap();
        }

        assert!(store.session_get("t1").await.unwrap().is_some());
        assert_eq!(store.session_delete_for_user("alice").await.unwrap(), 2);
        assert!(store.session_get("t1").await.unwrap().is_none());
        assert!(store.session_get("t3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn session_expiry_sweep() {
        let store = MemoryStore::new();
        let t = now();
        store
            .session_insert(&SessionRow {
                token: "old".to_owned(),
                username: "alice".to_owned(),
                created_at: t - TimeDelta::hours(2),
                expires_at: t - TimeDelta::hours(1),
            })
            .await
            .unwrap();
        store
            .session_insert(&SessionRow {
                token: "live".to_owned(),
                username: "alice".to_owned(),
                created_at: t,
                expires_at: t + TimeDelta::hours(1),
            })
            .await
            .unwrap();

        assert_eq!(store.session_delete_expired(t).await.unwrap(), 1);
        assert!(store.session_get("old").await.unwrap().is_none());
        assert!(store.session_get("live").await.unwrap().is_some());
    }

    fn entry(key: &str, actor: &str, action: &str, ts: DateTime<Utc>) -> NewAuditRow {
        NewAuditRow {
            timestamp: ts,
            action: action.to_owned(),
            key: key.to_owned(),
            actor: actor.to_owned(),
            actor_type: "user".to_owned(),
            result: "success".to_owned(),
            ip: "127.0.0.1".to_owned(),
            user_agent: "test".to_owned(),
            request_id: "req".to_owned(),
            value_size: Some(3),
        }
    }

    #[tokio::test]
    async fn audit_query_filters_and_counts() {
        let store = MemoryStore::new();
        let t = now();
        store
            .audit_insert(&entry("app/a", "alice", "read", t))
            .await
            .unwrap();
        store
            .audit_insert(&entry("app/b", "bob", "create", t + TimeDelta::seconds(1)))
            .await
            .unwrap();
        store
            .audit_insert(&entry("other/c", "alice", "read", t + TimeDelta::seconds(2)))
            .await
            .unwrap();

        let (rows, total) = store
            .audit_query(&AuditQuery {
                key: Some("app/*".to_owned()),
                limit: 10,
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        // Newest first.
        assert_eq!(rows[0].key, "app/b");

        let (rows, total) = store
            .audit_query(&AuditQuery {
                actor: Some("alice".to_owned()),
                limit: 10,
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn audit_query_pages() {
        let store = MemoryStore::new();
        let t = now();
        for i in 0..5 {
            store
                .audit_insert(&entry("k", "alice", "read", t + TimeDelta::seconds(i)))
                .await
                .unwrap();
        }
        let (rows, total) = store
            .audit_query(&AuditQuery {
                offset: 2,
                limit: 2,
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn audit_retention_deletes_old_rows() {
        let store = MemoryStore::new();
        let t = now();
        store
            .audit_insert(&entry("k", "alice", "read", t - TimeDelta::days(100)))
            .await
            .unwrap();
        store
            .audit_insert(&entry("k", "alice", "read", t))
            .await
            .unwrap();

        let removed = store
            .audit_delete_before(t - TimeDelta::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let (_, total) = store
            .audit_query(&AuditQuery {
                limit: 10,
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
    }
}
