//! A versioned, process-local cache of a conversation's active participant
//! ids, backed by a shared [`VersionStore`] (in-memory for a single replica,
//! Redis for a fleet). The counter in the store is the source of truth;
//! every process keeps a local copy tagged with the version it was read at
//! and drops it the moment a peer (or itself) bumps the counter.

mod memory_store;
mod redis_store;
mod store;

pub use memory_store::InMemoryVersionStore;
pub use redis_store::RedisVersionStore;
pub use store::{ParticipantInvalidation, VersionStore};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use wavelet_errors::Result;
use wavelet_observability::Metrics;

const DEFAULT_TTL_SECONDS: u64 = 300;

struct LocalEntry {
    version: i64,
    user_ids: Vec<String>,
}

/// `ParticipantCache` itself never talks to a broker or a database for the
/// participant roster; a miss just returns an empty list and the caller
/// (the authorization middleware) falls back to its own read port and
/// repopulates the cache via [`ParticipantCache::set`].
pub struct ParticipantCache {
    store: Arc<dyn VersionStore>,
    local: Mutex<HashMap<String, LocalEntry>>,
    ttl_seconds: u64,
    metrics: Metrics,
}

impl ParticipantCache {
    pub fn new(store: Arc<dyn VersionStore>, metrics: Metrics) -> Arc<Self> {
        Self::new_with_ttl(store, metrics, DEFAULT_TTL_SECONDS)
    }

    pub fn new_with_ttl(store: Arc<dyn VersionStore>, metrics: Metrics, ttl_seconds: u64) -> Arc<Self> {
        let cache = Arc::new(Self {
            store,
            local: Mutex::new(HashMap::new()),
            ttl_seconds,
            metrics,
        });
        cache.clone().spawn_invalidation_listener();
        cache
    }

    fn spawn_invalidation_listener(self: Arc<Self>) {
        let mut rx = self.store.subscribe_invalidations();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ParticipantInvalidation { conversation_id, version }) => {
                        let mut local = self.local.lock().await;
                        let stale = match local.get(&conversation_id) {
                            Some(entry) => version > entry.version,
                            None => false,
                        };
                        if stale {
                            local.remove(&conversation_id);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Returns the cached participant list, or an empty list on a miss —
    /// the caller is expected to fall back to its own source of truth and
    /// repopulate via [`Self::set`].
    pub async fn get(&self, conversation_id: &str) -> Result<Vec<String>> {
        let current = self.store.current_version(conversation_id).await?;

        {
            let local = self.local.lock().await;
            if let Some(entry) = local.get(conversation_id) {
                if entry.version == current {
                    self.metrics.counter("participant_cache_requests_total", "hit_local");
                    return Ok(entry.user_ids.clone());
                }
            }
        }

        match self.store.get_entry(conversation_id, current).await? {
            Some(user_ids) => {
                let mut local = self.local.lock().await;
                local.insert(
                    conversation_id.to_string(),
                    LocalEntry {
                        version: current,
                        user_ids: user_ids.clone(),
                    },
                );
                self.metrics.counter("participant_cache_requests_total", "hit_remote");
                Ok(user_ids)
            }
            None => {
                self.metrics.counter("participant_cache_requests_total", "miss");
                Ok(Vec::new())
            }
        }
    }

    /// Populates the cache at the conversation's current version.
    pub async fn set(&self, conversation_id: &str, user_ids: Vec<String>) -> Result<()> {
        let current = self.store.current_version(conversation_id).await?;
        self.store
            .set_entry(conversation_id, current, &user_ids, self.ttl_seconds)
            .await?;
        let mut local = self.local.lock().await;
        local.insert(
            conversation_id.to_string(),
            LocalEntry {
                version: current,
                user_ids,
            },
        );
        Ok(())
    }

    /// Bumps the version, drops the local entry, and fans the invalidation
    /// out to peers. Old-version entries are left as tombstones for their
    /// TTL rather than deleted — they're simply never looked up again once
    /// the counter has moved past them.
    pub async fn invalidate(&self, conversation_id: &str) -> Result<i64> {
        let new_version = self.store.bump_version(conversation_id).await?;
        self.local.lock().await.remove(conversation_id);
        self.store.publish_invalidation(conversation_id, new_version).await?;
        Ok(new_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new("participant_cache")
    }

    #[tokio::test]
    async fn get_on_empty_store_returns_empty_list() {
        let cache = ParticipantCache::new(Arc::new(InMemoryVersionStore::new()), metrics());
        assert_eq!(cache.get("c1").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = ParticipantCache::new(Arc::new(InMemoryVersionStore::new()), metrics());
        cache.set("c1", vec!["u1".to_string(), "u2".to_string()]).await.unwrap();
        assert_eq!(cache.get("c1").await.unwrap(), vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn invalidate_bumps_version_and_clears_local_entry() {
        let cache = ParticipantCache::new(Arc::new(InMemoryVersionStore::new()), metrics());
        cache.set("c1", vec!["u1".to_string()]).await.unwrap();
        let new_version = cache.invalidate("c1").await.unwrap();
        assert_eq!(new_version, 2);
        // The versioned entry under v1 still exists as a tombstone in the
        // store, but the counter has moved on so a fresh get sees a miss.
        assert_eq!(cache.get("c1").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn peer_invalidation_is_observed_once_version_is_newer() {
        let store = Arc::new(InMemoryVersionStore::new());
        let cache = ParticipantCache::new(store.clone(), metrics());
        cache.set("c1", vec!["u1".to_string()]).await.unwrap();

        // Simulate a peer bumping the counter and publishing the event.
        let new_version = store.bump_version("c1").await.unwrap();
        store.set_entry("c1", new_version, &["u2".to_string()], 300).await.unwrap();
        store.publish_invalidation("c1", new_version).await.unwrap();

        // Give the listener task a turn to process the broadcast.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(cache.get("c1").await.unwrap(), vec!["u2".to_string()]);
    }
}
