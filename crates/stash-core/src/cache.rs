//! In-process value cache.
//!
//! A size-bounded cache in front of the database, keyed by normalized key.
//! Loads coalesce: concurrent misses for the same key trigger exactly one
//! database read and every waiter receives the same result. Writers
//! invalidate after their write commits; a failed write must not touch the
//! cache, so invalidation lives with the caller, not here.

use std::sync::Arc;

use crate::error::KvError;
use crate::key::Format;

/// A cached value: decrypted bytes plus the format hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Value bytes as served to clients (plaintext for secrets paths).
    pub bytes: Arc<Vec<u8>>,
    /// Format hint recorded at write time.
    pub format: Format,
}

/// Bounded single-flight cache over `key → (bytes, format)`.
pub struct ValueCache {
    inner: moka::future::Cache<String, Value>,
}

impl std::fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCache")
            .field("entries", &self.inner.entry_count())
            .finish_non_exhaustive()
    }
}

impl ValueCache {
    /// Create a cache holding at most `max_entries` values.
    #[must_use]
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: moka::future::Cache::builder()
                .max_capacity(max_entries)
                .build(),
        }
    }

    /// Return the cached value or run `load` to populate it.
    ///
    /// Concurrent calls for the same key share one `load` execution; a load
    /// failure is handed to every waiter and nothing is cached.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error.
    pub async fn get_or_load<F>(&self, key: &str, load: F) -> Result<Value, KvError>
    where
        F: Future<Output = Result<Value, KvError>>,
    {
        self.inner
            .try_get_with(key.to_owned(), load)
            .await
            .map_err(|shared: Arc<KvError>| (*shared).clone())
    }

    /// Drop the cached value for a key, if any.
    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn value(text: &str) -> Value {
        Value {
            bytes: Arc::new(text.as_bytes().to_vec()),
            format: Format::Text,
        }
    }

    #[tokio::test]
    async fn load_populates_and_subsequent_hits_skip_loader() {
        let cache = ValueCache::new(16);
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let got = cache
                .get_or_load("k", async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(value("v"))
                })
                .await
                .unwrap();
            assert_eq!(*got.bytes, b"v");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_load() {
        let cache = Arc::new(ValueCache::new(16));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("shared", async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(value("once"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(*handle.await.unwrap().bytes, b"once");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = ValueCache::new(16);

        let err = cache
            .get_or_load("k", async {
                Err(KvError::NotFound {
                    key: "k".to_owned(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NotFound { .. }));

        // A later load succeeds — the failure was not pinned.
        let got = cache.get_or_load("k", async { Ok(value("v")) }).await.unwrap();
        assert_eq!(*got.bytes, b"v");
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = ValueCache::new(16);
        let loads = AtomicUsize::new(0);

        for expected in [1, 2] {
            cache
                .get_or_load("k", async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(value("v"))
                })
                .await
                .unwrap();
            assert_eq!(loads.load(Ordering::SeqCst), expected);
            cache.invalidate("k").await;
        }
    }
}
