use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wavelet_errors::Result;

/// A participant-list invalidation as it travels across processes:
/// `{conversationId, version}`. A receiver drops its local copy only when
/// `version` is newer than what it already has cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInvalidation {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub version: i64,
}

/// The versioned K/V + monotonic counter backing [`crate::ParticipantCache`].
/// The counter is the source of truth for "current version"; entries under
/// older versions are left in place as tombstones (TTL reclaims them) rather
/// than actively deleted.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Current version for a conversation, defaulting to 1 if never set.
    async fn current_version(&self, conversation_id: &str) -> Result<i64>;

    /// Atomically advances the counter and returns the new version.
    async fn bump_version(&self, conversation_id: &str) -> Result<i64>;

    async fn get_entry(&self, conversation_id: &str, version: i64) -> Result<Option<Vec<String>>>;

    async fn set_entry(
        &self,
        conversation_id: &str,
        version: i64,
        user_ids: &[String],
        ttl_seconds: u64,
    ) -> Result<()>;

    async fn publish_invalidation(&self, conversation_id: &str, version: i64) -> Result<()>;

    fn subscribe_invalidations(&self) -> broadcast::Receiver<ParticipantInvalidation>;
}

pub(crate) fn counter_key(conversation_id: &str) -> String {
    format!("conv:{conversation_id}:part:ver")
}

pub(crate) fn entry_key(conversation_id: &str, version: i64) -> String {
    format!("conv:{conversation_id}:participants:v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_the_documented_layout() {
        assert_eq!(counter_key("c1"), "conv:c1:part:ver");
        assert_eq!(entry_key("c1", 3), "conv:c1:participants:v3");
    }
}
