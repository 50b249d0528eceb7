//! Change-notification fan-out.
//!
//! Every committed write publishes to the set of topics derived from its
//! key: the exact key, every parent prefix (with a trailing `/`), and the
//! root topic `""` which sees everything. Subscribers hold a bounded
//! channel; publishing never awaits a network write, and a subscriber whose
//! buffer overflows is disconnected rather than allowed to stall the
//! publisher.
//!
//! Delivery is at-most-once with no replay. Shutdown drops every sender,
//! which ends each subscriber's stream promptly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What happened to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    /// Key created.
    Create,
    /// Key updated.
    Update,
    /// Key deleted.
    Delete,
}

/// One change notification. `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// The written key.
    pub key: String,
    /// What happened.
    pub action: EventAction,
    /// Commit-side timestamp, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Default)]
struct Topic {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<EventRecord>>>,
}

impl Topic {
    /// Fan a record out to every subscriber buffer. Full or closed
    /// subscribers are removed.
    fn dispatch(&self, record: &EventRecord) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|id, sender| match sender.try_send(record.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, key = %record.key, "slow subscriber disconnected");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// A live subscription. The stream ends when the bus shuts down or the
/// subscriber is dropped for falling behind.
#[derive(Debug)]
pub struct Subscription {
    /// The event channel; wrap in a stream for SSE delivery.
    pub receiver: mpsc::Receiver<EventRecord>,
}

/// The topic-based publish/subscribe bus.
pub struct EventBus {
    topics: RwLock<HashMap<String, std::sync::Arc<Topic>>>,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish a change to every topic derived from the key.
    ///
    /// Fire-and-forget: delivery failures only ever affect the failing
    /// subscriber.
    pub fn publish(&self, key: &str, action: EventAction) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let record = EventRecord {
            key: key.to_owned(),
            action,
            timestamp: Utc::now().timestamp_millis(),
        };
        for topic_name in topics_for(key) {
            let topic = {
                let Ok(topics) = self.topics.read() else {
                    return;
                };
                topics.get(&topic_name).cloned()
            };
            if let Some(topic) = topic {
                topic.dispatch(&record);
            }
        }
        debug!(key, ?action, "event published");
    }

    /// Join a topic. The topic string comes from
    /// [`topic_from_path`]; `""` is the root topic.
    pub fn subscribe(&self, topic_name: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut topics) = self.topics.write() {
            let topic = topics
                .entry(topic_name.to_owned())
                .or_default();
            if let Ok(mut subscribers) = topic.subscribers.lock() {
                subscribers.insert(id, sender);
            }
        }
        Subscription { receiver }
    }

    /// Close every subscription. Publishing becomes a no-op; each
    /// subscriber's stream ends as soon as it drains its buffer.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut topics) = self.topics.write() {
            for topic in topics.values() {
                if let Ok(mut subscribers) = topic.subscribers.lock() {
                    subscribers.clear();
                }
            }
            topics.clear();
        }
    }
}

/// The topics a write to `key` publishes to: the exact key, each parent
/// prefix with a trailing `/`, and the root topic `""`.
#[must_use]
pub fn topics_for(key: &str) -> Vec<String> {
    let mut topics = Vec::with_capacity(4);
    topics.push(key.to_owned());
    for (idx, _) in key.match_indices('/') {
        topics.push(key[..=idx].to_owned());
    }
    topics.push(String::new());
    topics
}

/// Map a subscription path (the part after `subscribe/`) to a topic:
///
/// - `*` → the root topic `""`
/// - `<prefix>/*` or `<prefix>/` → the prefix topic `<prefix>/`
/// - anything else → the exact-key topic
///
/// Returns `None` for an empty or unusable path.
#[must_use]
pub fn topic_from_path(path: &str) -> Option<String> {
    if path == "*" {
        return Some(String::new());
    }
    let (raw, prefix) = match path.strip_suffix("/*") {
        Some(p) => (p, true),
        None => match path.strip_suffix('/') {
            Some(p) => (p, true),
            None => (path, false),
        },
    };
    let normalized = crate::key::normalize_key(raw).ok()?;
    if prefix {
        Some(format!("{normalized}/"))
    } else {
        Some(normalized)
    }
}

/// The key whose read permission gates a subscription to `topic`. Prefix
/// topics (and the root) are checked via a representative child key.
#[must_use]
pub fn representative_key(topic: &str) -> String {
    if topic.is_empty() {
        "test".to_owned()
    } else if topic.ends_with('/') {
        format!("{topic}test")
    } else {
        topic.to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn topics_for_nested_key() {
        assert_eq!(topics_for("a/b/c"), vec!["a/b/c", "a/", "a/b/", ""]);
    }

    #[test]
    fn topics_for_flat_key() {
        assert_eq!(topics_for("app"), vec!["app", ""]);
    }

    #[test]
    fn subscription_path_grammar() {
        assert_eq!(topic_from_path("*").unwrap(), "");
        assert_eq!(topic_from_path("app/*").unwrap(), "app/");
        assert_eq!(topic_from_path("app/").unwrap(), "app/");
        assert_eq!(topic_from_path("app/cfg").unwrap(), "app/cfg");
        assert_eq!(topic_from_path("a/b/*").unwrap(), "a/b/");
        assert!(topic_from_path("").is_none());
        assert!(topic_from_path("/").is_none());
    }

    #[test]
    fn representative_keys() {
        assert_eq!(representative_key(""), "test");
        assert_eq!(representative_key("app/"), "app/test");
        assert_eq!(representative_key("app/cfg"), "app/cfg");
    }

    #[tokio::test]
    async fn exact_subscriber_sees_only_its_key() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("app/cfg");

        bus.publish("app/cfg", EventAction::Create);
        bus.publish("app/other", EventAction::Create);

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.key, "app/cfg");
        assert_eq!(event.action, EventAction::Create);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn prefix_subscriber_sees_descendants_only() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("app/");

        bus.publish("app/a/b", EventAction::Create);
        bus.publish("other/x", EventAction::Delete);

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.key, "app/a/b");
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn root_subscriber_sees_everything() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("");

        bus.publish("a", EventAction::Create);
        bus.publish("deeply/nested/key", EventAction::Update);

        assert_eq!(sub.receiver.recv().await.unwrap().key, "a");
        assert_eq!(sub.receiver.recv().await.unwrap().key, "deeply/nested/key");
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_disconnected() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe("");
        let mut healthy = bus.subscribe("");

        // Fill the slow subscriber's buffer and push one more.
        bus.publish("k1", EventAction::Create);
        bus.publish("k2", EventAction::Create);
        // Drain the healthy subscriber so it has room.
        assert_eq!(healthy.receiver.recv().await.unwrap().key, "k1");
        assert_eq!(healthy.receiver.recv().await.unwrap().key, "k2");
        bus.publish("k3", EventAction::Create);

        // The slow subscriber got the buffered two, then its stream ends.
        assert_eq!(slow.receiver.recv().await.unwrap().key, "k1");
        assert_eq!(slow.receiver.recv().await.unwrap().key, "k2");
        assert!(slow.receiver.recv().await.is_none());

        // The healthy subscriber keeps receiving.
        assert_eq!(healthy.receiver.recv().await.unwrap().key, "k3");
    }

    #[tokio::test]
    async fn shutdown_ends_streams_and_mutes_publish() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("app/");

        bus.publish("app/x", EventAction::Create);
        bus.shutdown();
        bus.publish("app/y", EventAction::Create);

        // Buffered event still drains, then the stream ends.
        assert_eq!(sub.receiver.recv().await.unwrap().key, "app/x");
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("app/");
        drop(sub);
        // No panic, no delivery; the closed sender is removed lazily.
        bus.publish("app/x", EventAction::Create);
    }

    #[test]
    fn event_record_serializes_for_the_wire() {
        let record = EventRecord {
            key: "app/cfg".to_owned(),
            action: EventAction::Create,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"key":"app/cfg","action":"create","timestamp":1700000000000}"#
        );
    }
}
