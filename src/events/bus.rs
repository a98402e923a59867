use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::events::Topic;

/// A lazy, potentially infinite sequence of message payloads. It ends when
/// the underlying transport drops.
pub type PayloadStream = BoxStream<'static, String>;

/// Fire-and-forget publish/subscribe.
///
/// There is no persistence and no delivery guarantee: a message published
/// while nobody is subscribed is lost.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a payload on a topic.
    async fn publish(&self, topic: Topic, payload: &str) -> Result<()>;

    /// Opens a new subscription to a topic.
    async fn subscribe(&self, topic: Topic) -> Result<PayloadStream>;
}

/// A Redis pub/sub event bus.
#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisEventBus {
    /// Creates a new `RedisEventBus`.
    ///
    /// # Arguments
    ///
    /// * `client` - Used to open dedicated subscriber connections.
    /// * `publisher` - The shared connection used for `PUBLISH`.
    pub fn new(client: redis::Client, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: Topic, payload: &str) -> Result<()> {
        let receivers: i64 = self
            .publisher
            .clone()
            .publish(topic.as_str(), payload)
            .await
            .map_err(|e| AppError::Publish(e.to_string()))?;

        if receivers == 0 {
            tracing::debug!("No subscriber on {}; message dropped", topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<PayloadStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| AppError::Publish(format!("subscribe connection: {}", e)))?;

        pubsub
            .subscribe(topic.as_str())
            .await
            .map_err(|e| AppError::Publish(format!("subscribe {}: {}", topic, e)))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!("⚠️  Dropping non-text message on {}: {}", msg.get_channel_name(), e);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Up to a tenth of the backoff, so listeners do not reconnect in lockstep.
fn with_jitter(backoff: Duration) -> Duration {
    let max_ms = (backoff.as_millis() / 10) as u64;
    if max_ms == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Keeps a subscription to `topic` alive until `shutdown` is cancelled.
///
/// Every payload is passed to `handler` in arrival order. When the stream
/// ends or subscribing fails, the loop waits `backoff` and subscribes again.
pub async fn run_subscriber<F, Fut>(
    bus: Arc<dyn EventBus>,
    topic: Topic,
    backoff: Duration,
    shutdown: CancellationToken,
    mut handler: F,
) where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        match bus.subscribe(topic).await {
            Ok(mut stream) => {
                tracing::info!("✅ Subscribed to {}", topic);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!("🛑 Subscriber for {} shutting down", topic);
                            return;
                        }
                        next = stream.next() => match next {
                            Some(payload) => handler(payload).await,
                            None => break,
                        },
                    }
                }
                tracing::warn!("⚠️  Subscription to {} lost. Reconnecting...", topic);
            }
            Err(e) => {
                tracing::error!("❌ Failed to subscribe to {}: {}", topic, e);
            }
        }

        let delay = with_jitter(backoff);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
