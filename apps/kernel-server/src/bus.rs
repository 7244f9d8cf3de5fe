// [[AXON]]/apps/kernel-server/src/bus.rs
// Purpose: Per-run pub/sub fan-out. Redis-backed with in-memory fallback.
// Architecture: Event Transport Layer
// Dependencies: tokio, redis, dashmap, serde_json, chrono

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Channel name carrying all events for one run.
pub fn channel_for(run_id: &str) -> String {
    format!("execution:{}", run_id)
}

/// Stamp the event with the publish-time UTC timestamp.
fn stamp(event: &mut Value) {
    if let Some(obj) = event.as_object_mut() {
        obj.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
}

/// Pub/sub transport between the engine and streaming subscribers.
///
/// Publishing is fire-and-forget: no subscriber means the event is
/// dropped, and a slow subscriber never blocks the publisher. Dropping a
/// Subscription unsubscribes (idempotently — it is just a drop).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, event: Value);
    async fn subscribe(&self, channel: &str) -> Subscription;
}

/// Handle yielding messages published to one channel, in publish order.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    /// Next message, or None once the channel is torn down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

// === IN-MEMORY BUS ===

/// Broadcast-channel bus for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, mut event: Value) {
        stamp(&mut event);
        if let Some(tx) = self.channels.get(channel) {
            // Err here just means nobody is listening.
            let _ = tx.send(event.to_string());
        }
    }

    async fn subscribe(&self, channel: &str) -> Subscription {
        let mut broadcast_rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .subscribe();

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break; // subscriber dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("bus subscriber lagged, dropped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { rx }
    }
}

// === REDIS BUS ===

/// Redis pub/sub bus. Each subscription holds its own pub/sub connection,
/// as the engine side and every streaming client are independent tasks.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(client: redis::Client) -> redis::RedisResult<Self> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(RedisBus { client, publisher })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: &str, mut event: Value) {
        stamp(&mut event);
        let mut conn = self.publisher.clone();
        let result: redis::RedisResult<i64> = conn.publish(channel, event.to_string()).await;
        if let Err(e) = result {
            tracing::error!("redis publish on {} failed: {}", channel, e);
        }
    }

    async fn subscribe(&self, channel: &str) -> Subscription {
        let client = self.client.clone();
        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let conn = match client.get_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("redis subscribe connection failed: {}", e);
                    return;
                }
            };
            let mut pubsub = conn.into_pubsub();
            if let Err(e) = pubsub.subscribe(&channel).await {
                tracing::error!("redis subscribe to {} failed: {}", channel, e);
                return;
            }
            let _ = ready_tx.send(());

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if tx.send(payload).await.is_err() {
                    break; // subscriber dropped, tear down the connection
                }
            }
        });

        // Don't return before the SUBSCRIBE lands, or the caller could
        // miss events published immediately afterwards.
        let _ = ready_rx.await;

        Subscription { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped_silently() {
        let bus = MemoryBus::new();
        bus.publish("execution:none", json!({"type": "workflow_status"}))
            .await;
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_publish_order_with_timestamps() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("execution:r1").await;

        for i in 0..5 {
            bus.publish("execution:r1", json!({"type": "agent_output_chunk", "seq": i}))
                .await;
        }

        for i in 0..5 {
            let raw = sub.recv().await.expect("message");
            let event: Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(event["seq"], i);
            assert!(event["timestamp"].is_string(), "bus must stamp timestamps");
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("execution:r1").await;
        let mut b = bus.subscribe("execution:r1").await;

        bus.publish("execution:r1", json!({"type": "workflow_status"}))
            .await;

        let got_a: Value = serde_json::from_str(&a.recv().await.unwrap()).unwrap();
        let got_b: Value = serde_json::from_str(&b.recv().await.unwrap()).unwrap();
        assert_eq!(got_a["type"], "workflow_status");
        assert_eq!(got_b["type"], "workflow_status");
    }

    #[tokio::test]
    async fn channels_are_isolated_per_run() {
        let bus = MemoryBus::new();
        let mut other = bus.subscribe(&channel_for("r2")).await;
        let mut mine = bus.subscribe(&channel_for("r1")).await;

        bus.publish(&channel_for("r1"), json!({"type": "workflow_status"}))
            .await;
        bus.publish(&channel_for("r2"), json!({"type": "error"})).await;

        let got: Value = serde_json::from_str(&mine.recv().await.unwrap()).unwrap();
        assert_eq!(got["type"], "workflow_status");
        let got: Value = serde_json::from_str(&other.recv().await.unwrap()).unwrap();
        assert_eq!(got["type"], "error");
    }

    #[test]
    fn channel_name_scheme() {
        assert_eq!(channel_for("abc"), "execution:abc");
    }
}
