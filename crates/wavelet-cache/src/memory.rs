use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use wavelet_errors::Result;

use crate::provider::{now_millis, CacheEnvelope, CacheProvider};

struct Entry {
    envelope: CacheEnvelope<serde_json::Value>,
    /// `None` means the entry never expires (`ttlSeconds=0`).
    expires_at: Option<i64>,
}

struct State {
    entries: HashMap<String, Entry>,
    /// Least-recently-used ordering, oldest first. Rebuilt on access rather
    /// than kept as an intrusive list; fine at the sizes this cache runs at.
    order: Vec<String>,
}

/// A bounded, TTL-aware in-memory LRU. `max_items` caps the entry count;
/// `set` evicts the oldest entry when over capacity and the key being
/// written is new.
pub struct InMemoryCacheProvider {
    max_items: usize,
    state: Mutex<State>,
    invalidations: tokio::sync::broadcast::Sender<crate::provider::InvalidationEvent>,
}

impl InMemoryCacheProvider {
    pub fn new(max_items: usize) -> Self {
        let (invalidations, _) = tokio::sync::broadcast::channel(64);
        Self {
            max_items,
            state: Mutex::new(State {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            invalidations,
        }
    }

    fn touch(order: &mut Vec<String>, key: &str) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push(key.to_string());
    }
}

#[async_trait]
impl CacheProvider for InMemoryCacheProvider {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.order.clear();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEnvelope<serde_json::Value>>> {
        let mut state = self.state.lock().await;
        let now = now_millis();

        let expired = match state.entries.get(key) {
            Some(entry) => matches!(entry.expires_at, Some(deadline) if now >= deadline),
            None => return Ok(None),
        };

        if expired {
            state.entries.remove(key);
            state.order.retain(|k| k != key);
            return Ok(None);
        }

        Self::touch(&mut state.order, key);
        Ok(state.entries.get(key).map(|e| e.envelope.clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl_seconds: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().await;
        let is_new = !state.entries.contains_key(key);

        if is_new && state.entries.len() >= self.max_items && !state.order.is_empty() {
            let oldest = state.order.remove(0);
            state.entries.remove(&oldest);
        }

        let expires_at = match ttl_seconds {
            None | Some(0) => None,
            Some(secs) => Some(now_millis() + (secs as i64) * 1000),
        };

        state.entries.insert(
            key.to_string(),
            Entry {
                envelope: CacheEnvelope {
                    value,
                    stored_at: now_millis(),
                },
                expires_at,
            },
        );
        Self::touch(&mut state.order, key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.remove(key);
        state.order.retain(|k| k != key);
        Ok(())
    }

    fn subscribe_invalidations(&self) -> tokio::sync::broadcast::Receiver<crate::provider::InvalidationEvent> {
        self.invalidations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_oldest_when_over_capacity() {
        let cache = InMemoryCacheProvider::new(2);
        cache.set("a", serde_json::json!(1), None).await.unwrap();
        cache.set("b", serde_json::json!(2), None).await.unwrap();
        cache.set("c", serde_json::json!(3), None).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_promotes_key_and_saves_it_from_eviction() {
        let cache = InMemoryCacheProvider::new(2);
        cache.set("a", serde_json::json!(1), None).await.unwrap();
        cache.set("b", serde_json::json!(2), None).await.unwrap();
        // touch `a` so `b` becomes the oldest
        cache.get("a").await.unwrap();
        cache.set("c", serde_json::json!(3), None).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cache = InMemoryCacheProvider::new(10);
        cache.set("a", serde_json::json!(1), Some(0)).await.unwrap();
        assert!(cache.get("a").await.unwrap().is_some()); // ttl=0 never expires

        // Force an already-elapsed deadline by writing directly into state.
        {
            let mut state = cache.state.lock().await;
            state.entries.get_mut("a").unwrap().expires_at = Some(now_millis() - 1);
        }
        assert!(cache.get("a").await.unwrap().is_none());
    }
}
