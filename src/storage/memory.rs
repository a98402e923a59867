use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::storage::token_store::{current_key, token_key, TokenStore};

/// An in-process expiring map with the same semantics as the Redis store.
///
/// Expired entries are invisible to reads immediately and purged on the next
/// write.
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, key: String, value: &str, ttl: Duration) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key, (value.to_string(), now + ttl));
    }

    async fn live(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Number of unexpired entries, including display slots.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, class_id: &str, token_id: &str, ciphertext: &str, ttl: Duration) -> Result<()> {
        self.insert(token_key(class_id, token_id), ciphertext, ttl).await;
        Ok(())
    }

    async fn exists(&self, class_id: &str, token_id: &str) -> Result<bool> {
        Ok(self.live(&token_key(class_id, token_id)).await.is_some())
    }

    async fn get(&self, class_id: &str, token_id: &str) -> Result<String> {
        self.live(&token_key(class_id, token_id))
            .await
            .ok_or(AppError::NotFound)
    }

    async fn set_current(&self, class_id: &str, ciphertext: &str, ttl: Duration) -> Result<()> {
        self.insert(current_key(class_id), ciphertext, ttl).await;
        Ok(())
    }

    async fn current(&self, class_id: &str) -> Result<String> {
        self.live(&current_key(class_id)).await.ok_or(AppError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_disappears_after_ttl() {
        let store = MemoryTokenStore::new();
        store.put("C1", "u1", "sealed", Duration::from_secs(1)).await.unwrap();

        assert!(store.exists("C1", "u1").await.unwrap());
        assert_eq!(store.get("C1", "u1").await.unwrap(), "sealed");

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(!store.exists("C1", "u1").await.unwrap());
        assert!(matches!(store.get("C1", "u1").await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn classes_do_not_share_tokens() {
        let store = MemoryTokenStore::new();
        store.put("C1", "u1", "sealed", Duration::from_secs(30)).await.unwrap();

        assert!(!store.exists("C2", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn current_slot_tracks_latest_put() {
        let store = MemoryTokenStore::new();
        assert!(matches!(store.current("C1").await, Err(AppError::NotFound)));

        store.set_current("C1", "first", Duration::from_secs(30)).await.unwrap();
        store.set_current("C1", "second", Duration::from_secs(30)).await.unwrap();

        assert_eq!(store.current("C1").await.unwrap(), "second");
        assert_eq!(store.len().await, 1);
    }
}
