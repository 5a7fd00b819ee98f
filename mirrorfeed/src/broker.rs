//! In-memory multi-subscriber event fan-out.
//!
//! Each subscriber gets its own bounded channel; a slow consumer whose
//! queue fills is dropped from the subscriber list rather than allowed
//! to stall the publisher — publishing must never block.

use serde::Serialize;
use tokio::sync::mpsc;

/// Bound on each subscriber's queue (see DESIGN.md).
const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: serde_json::Value,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<String>,
}

pub struct Broker {
    subscribers: tokio::sync::Mutex<Vec<Subscriber>>,
    next_id: std::sync::atomic::AtomicU64,
}

/// Handle returned to a new subscriber; the transport drains `receiver`
/// and calls `unsubscribe` when the connection closes.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<String>,
}

impl Broker {
    pub fn new() -> Self {
        Broker {
            subscribers: tokio::sync::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().await.push(Subscriber { id, sender });
        Subscription { id, receiver }
    }

    /// Idempotent: removing an id that is already gone is a no-op.
    pub async fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| s.id != id);
    }

    /// Serializes `{type: kind, data: payload}` once and attempts a
    /// non-blocking send to every subscriber. Subscribers whose queue is
    /// full are dropped rather than retried.
    pub async fn publish(&self, kind: &str, payload: serde_json::Value) {
        let envelope = Envelope { kind, data: payload };
        let serialized = match serde_json::to_string(&envelope) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize broker event");
                return;
            }
        };

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|subscriber| match subscriber.sender.try_send(serialized.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber_id = subscriber.id, "dropping slow SSE subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers_in_order() {
        let broker = Broker::new();
        let mut sub1 = broker.subscribe().await;
        let mut sub2 = broker.subscribe().await;

        broker.publish("tick", serde_json::json!({"target": 1})).await;
        broker.publish("cooldown", serde_json::json!({"target": 1})).await;

        let first = sub1.receiver.recv().await.unwrap();
        let second = sub1.receiver.recv().await.unwrap();
        assert!(first.contains("tick"));
        assert!(second.contains("cooldown"));

        let first2 = sub2.receiver.recv().await.unwrap();
        assert!(first2.contains("tick"));
    }

    #[tokio::test]
    async fn full_subscriber_queue_is_dropped_without_blocking_publisher() {
        let broker = Broker::new();
        // Fill channel capacity (64) plus one extra publish to force overflow.
        let sub = broker.subscribe().await;
        for i in 0..SUBSCRIBER_CAPACITY + 1 {
            broker
                .publish("tick", serde_json::json!({"n": i}))
                .await;
        }
        assert_eq!(broker.subscriber_count().await, 0);
        drop(sub);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let broker = Broker::new();
        let sub = broker.subscribe().await;
        broker.unsubscribe(sub.id).await;
        broker.unsubscribe(sub.id).await;
        assert_eq!(broker.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_removed_but_others_keep_receiving() {
        let broker = Broker::new();
        let slow = broker.subscribe().await;
        let mut fast = broker.subscribe().await;

        // Overflow the slow subscriber's queue without draining it.
        for i in 0..SUBSCRIBER_CAPACITY + 1 {
            broker.publish("tick", serde_json::json!({"n": i})).await;
        }
        assert_eq!(broker.subscriber_count().await, 1);

        broker.publish("new_post", serde_json::json!({"id": "t1"})).await;
        // Fast subscriber still gets the backlog plus the new publish.
        let mut saw_new_post = false;
        while let Ok(msg) = fast.receiver.try_recv() {
            if msg.contains("new_post") {
                saw_new_post = true;
            }
        }
        assert!(saw_new_post);
        drop(slow);
    }
}
