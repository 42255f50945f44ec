use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use wavelet_errors::Result;

use crate::store::{ParticipantInvalidation, VersionStore};

struct State {
    versions: HashMap<String, i64>,
    entries: HashMap<(String, i64), Vec<String>>,
}

/// A single-process [`VersionStore`]. Useful for tests and for a
/// single-replica deployment; real multi-replica deployments want
/// `RedisVersionStore` so the counter and entries are shared.
pub struct InMemoryVersionStore {
    state: Mutex<State>,
    invalidations: broadcast::Sender<ParticipantInvalidation>,
}

impl Default for InMemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State {
                versions: HashMap::new(),
                entries: HashMap::new(),
            }),
            invalidations,
        }
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn current_version(&self, conversation_id: &str) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(*state.versions.get(conversation_id).unwrap_or(&1))
    }

    async fn bump_version(&self, conversation_id: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        let next = state.versions.get(conversation_id).copied().unwrap_or(1) + 1;
        state.versions.insert(conversation_id.to_string(), next);
        Ok(next)
    }

    async fn get_entry(&self, conversation_id: &str, version: i64) -> Result<Option<Vec<String>>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(&(conversation_id.to_string(), version)).cloned())
    }

    async fn set_entry(
        &self,
        conversation_id: &str,
        version: i64,
        user_ids: &[String],
        _ttl_seconds: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .entries
            .insert((conversation_id.to_string(), version), user_ids.to_vec());
        Ok(())
    }

    async fn publish_invalidation(&self, conversation_id: &str, version: i64) -> Result<()> {
        let _ = self.invalidations.send(ParticipantInvalidation {
            conversation_id: conversation_id.to_string(),
            version,
        });
        Ok(())
    }

    fn subscribe_invalidations(&self) -> broadcast::Receiver<ParticipantInvalidation> {
        self.invalidations.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bump_version_is_monotonic() {
        let store = InMemoryVersionStore::new();
        assert_eq!(store.current_version("c1").await.unwrap(), 1);
        assert_eq!(store.bump_version("c1").await.unwrap(), 2);
        assert_eq!(store.bump_version("c1").await.unwrap(), 3);
        assert_eq!(store.current_version("c1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn entries_are_keyed_by_conversation_and_version() {
        let store = InMemoryVersionStore::new();
        store
            .set_entry("c1", 1, &["u1".to_string(), "u2".to_string()], 300)
            .await
            .unwrap();
        assert_eq!(
            store.get_entry("c1", 1).await.unwrap(),
            Some(vec!["u1".to_string(), "u2".to_string()])
        );
        assert_eq!(store.get_entry("c1", 2).await.unwrap(), None);
    }
}
