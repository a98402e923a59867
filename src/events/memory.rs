use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{AppError, Result};
use crate::events::bus::{EventBus, PayloadStream};
use crate::models::events::Topic;

const CHANNEL_CAPACITY: usize = 256;

/// An in-process bus with Redis pub/sub semantics: messages go only to the
/// subscribers connected at publish time.
#[derive(Clone, Default)]
pub struct MemoryEventBus {
    channels: Arc<Mutex<HashMap<Topic, broadcast::Sender<String>>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends every open subscription, as a dropped transport would.
    pub fn disconnect_all(&self) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }
    }

    /// Number of subscribers currently connected to `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(&topic).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: Topic, payload: &str) -> Result<()> {
        let sender = {
            let channels = self
                .channels
                .lock()
                .map_err(|_| AppError::Publish("bus lock poisoned".to_string()))?;
            channels.get(&topic).cloned()
        };

        match sender {
            Some(tx) if tx.send(payload.to_string()).is_ok() => {}
            _ => tracing::debug!("No subscriber on {}; message dropped", topic),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<PayloadStream> {
        let receiver = {
            let mut channels = self
                .channels
                .lock()
                .map_err(|_| AppError::Publish("bus lock poisoned".to_string()))?;
            channels
                .entry(topic)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let stream = stream::unfold(receiver, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("⚠️  Subscriber on {} lagged; {} messages lost", topic, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
