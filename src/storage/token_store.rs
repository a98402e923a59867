use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use crate::error::{AppError, Result};

/// The key holding one minted token.
///
/// Identifiers are validated to be free of `:` before they reach the store,
/// so keys of different classes cannot collide.
pub fn token_key(class_id: &str, token_id: &str) -> String {
    format!("qr:{}:{}", class_id, token_id)
}

/// The key holding the latest token of a class, read by the display side.
pub fn current_key(class_id: &str) -> String {
    format!("qr_current:{}", class_id)
}

/// Time-boxed storage of sealed tokens.
///
/// An entry's presence is the only authority for "this token is still
/// valid". Entries disappear on their own once their TTL elapses.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Inserts or overwrites a token with an expiry.
    async fn put(&self, class_id: &str, token_id: &str, ciphertext: &str, ttl: Duration) -> Result<()>;

    /// Whether the token is currently stored.
    async fn exists(&self, class_id: &str, token_id: &str) -> Result<bool>;

    /// Reads a token back; `NotFound` once it has expired.
    async fn get(&self, class_id: &str, token_id: &str) -> Result<String>;

    /// Points the class's display slot at the newest token.
    async fn set_current(&self, class_id: &str, ciphertext: &str, ttl: Duration) -> Result<()>;

    /// The newest live token of a class; `NotFound` when there is none.
    async fn current(&self, class_id: &str) -> Result<String>;
}

/// Millisecond TTL for `SET .. PX`, never zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// A Redis-backed token store.
#[derive(Clone)]
pub struct RedisTokenStore {
    redis: ConnectionManager,
}

impl RedisTokenStore {
    /// Creates a new `RedisTokenStore`.
    ///
    /// # Arguments
    ///
    /// * `redis` - The Redis connection manager.
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.redis.clone())
            .await
            .map_err(|e| {
                tracing::error!("❌ Redis SET failed for key {}: {}", key, e);
                AppError::StoreUnavailable(e)
            })?;
        Ok(())
    }

    async fn get_key(&self, key: &str) -> Result<String> {
        let value: Option<String> = self.redis.clone().get(key).await?;
        value.ok_or(AppError::NotFound)
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn put(&self, class_id: &str, token_id: &str, ciphertext: &str, ttl: Duration) -> Result<()> {
        self.set_px(&token_key(class_id, token_id), ciphertext, ttl).await
    }

    async fn exists(&self, class_id: &str, token_id: &str) -> Result<bool> {
        let exists: bool = self
            .redis
            .clone()
            .exists(token_key(class_id, token_id))
            .await?;
        Ok(exists)
    }

    async fn get(&self, class_id: &str, token_id: &str) -> Result<String> {
        self.get_key(&token_key(class_id, token_id)).await
    }

    async fn set_current(&self, class_id: &str, ciphertext: &str, ttl: Duration) -> Result<()> {
        self.set_px(&current_key(class_id), ciphertext, ttl).await
    }

    async fn current(&self, class_id: &str) -> Result<String> {
        self.get_key(&current_key(class_id)).await
    }
}
