// # Event Bus
//
// In-process pub/sub carrying lifecycle events between subsystems and out to
// the external UI. Each subscription owns an unbounded channel drained by a
// dedicated worker, so publishers never block and delivery per topic stays
// FIFO from a single producer. Handler failures are logged, never propagated.
//
// Topic patterns support a trailing wildcard segment: `connection.*` matches
// `connection.state` and `connection.error`; `*` matches everything.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Canonical topic names published by the core.
pub mod topics {
    pub const CONNECTION_STATE: &str = "connection.state";
    pub const CONNECTION_ERROR: &str = "connection.error";
    pub const AGENT_STATE: &str = "agent.state";
    pub const AGENT_STEP: &str = "agent.step";
    pub const SAFETY_DECISION: &str = "safety.decision";
    pub const APPROVAL_REQUIRED: &str = "approval.required";
    pub const APPROVAL_RESOLVED: &str = "approval.resolved";
    pub const HEALTH_REPORT: &str = "health.report";
    pub const CACHE_INVALIDATE: &str = "cache.invalidate";
}

/// A message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl EventMessage {
    pub fn new(topic: &str, source: &str, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
            source: source.to_string(),
        }
    }
}

/// Subscriber callback. Runs on the bus's execution context.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: EventMessage) -> crate::error::Result<()>;
}

/// Opaque handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscription {
    pattern: String,
    tx: mpsc::UnboundedSender<EventMessage>,
}

/// Per-topic delivery counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// The bus itself. Cheap to clone via `Arc`.
pub struct EventBus {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    per_topic: DashMap<String, TopicMetrics>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            per_topic: DashMap::new(),
        }
    }

    /// Register a handler for a topic pattern. The handler runs on a
    /// dedicated worker task; events it receives stay in publish order.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel::<EventMessage>();

        let worker_pattern = pattern.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let topic = message.topic.clone();
                let handler = Arc::clone(&handler);
                // Run each delivery inside its own task so a panicking
                // handler is contained without breaking per-topic ordering.
                let outcome =
                    tokio::spawn(async move { handler.handle(message).await }).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(pattern = %worker_pattern, topic = %topic, error = %e, "event handler failed");
                    }
                    Err(join_err) => {
                        tracing::error!(pattern = %worker_pattern, topic = %topic, error = %join_err, "event handler panicked");
                    }
                }
            }
        });

        self.subscriptions.insert(
            id,
            Subscription {
                pattern: pattern.to_string(),
                tx,
            },
        );
        id
    }

    /// Subscribe as a channel instead of a handler; used by external UIs.
    pub fn subscribe_channel(&self, pattern: &str) -> (SubscriptionId, mpsc::UnboundedReceiver<EventMessage>) {
        let id = SubscriptionId(Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(
            id,
            Subscription {
                pattern: pattern.to_string(),
                tx,
            },
        );
        (id, rx)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.remove(&id);
    }

    /// Publish to every matching subscription without blocking.
    pub fn publish(&self, message: EventMessage) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.per_topic.entry(message.topic.clone()).or_default();
        entry.published += 1;

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for sub in self.subscriptions.iter() {
            if topic_matches(&sub.pattern, &message.topic) {
                if sub.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dropped += 1;
                }
            }
        }
        entry.delivered += delivered;
        entry.dropped += dropped;
        drop(entry);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Convenience wrapper building the message envelope.
    pub fn emit(&self, topic: &str, source: &str, payload: serde_json::Value) {
        self.publish(EventMessage::new(topic, source, payload));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn topic_metrics(&self, topic: &str) -> TopicMetrics {
        self.per_topic
            .get(topic)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn totals(&self) -> TopicMetrics {
        TopicMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Match a subscription pattern against a concrete topic. Only a trailing
/// `*` wildcard segment is supported.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pattern_matching() {
        assert!(topic_matches("*", "connection.state"));
        assert!(topic_matches("connection.state", "connection.state"));
        assert!(topic_matches("connection.*", "connection.state"));
        assert!(topic_matches("connection.*", "connection.error"));
        assert!(!topic_matches("connection.*", "connections.state"));
        assert!(!topic_matches("connection.*", "connection"));
        assert!(!topic_matches("agent.*", "connection.state"));
    }

    #[tokio::test]
    async fn delivers_in_fifo_order_per_topic() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel("agent.*");

        for i in 0..10 {
            bus.emit(topics::AGENT_STEP, "test", serde_json::json!({ "i": i }));
        }

        for i in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn handler_failure_never_reaches_publisher() {
        struct Failing;
        #[async_trait::async_trait]
        impl EventHandler for Failing {
            async fn handle(&self, _m: EventMessage) -> crate::error::Result<()> {
                Err(crate::error::DbError::Internal("handler boom".into()))
            }
        }

        let bus = EventBus::new();
        bus.subscribe("health.*", Arc::new(Failing));
        // Publishing must not error or panic.
        bus.emit(topics::HEALTH_REPORT, "test", serde_json::json!({}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.totals().delivered, 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe_channel("*");
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        bus.emit(topics::CACHE_INVALIDATE, "test", serde_json::json!({}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn counts_per_topic() {
        let bus = EventBus::new();
        let (_id, _rx) = bus.subscribe_channel("connection.*");
        bus.emit(topics::CONNECTION_STATE, "pool", serde_json::json!({}));
        bus.emit(topics::CONNECTION_STATE, "pool", serde_json::json!({}));
        bus.emit(topics::AGENT_STATE, "agent", serde_json::json!({}));

        let m = bus.topic_metrics(topics::CONNECTION_STATE);
        assert_eq!(m.published, 2);
        assert_eq!(m.delivered, 2);
        assert_eq!(bus.topic_metrics(topics::AGENT_STATE).delivered, 0);
    }
}
