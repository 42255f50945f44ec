use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wavelet_errors::Result;

/// A stored value plus the wall-clock time it was written, in epoch-ms.
/// `stored_at` is what the staleness predicate in `CacheManager` consults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub value: T,
    #[serde(rename = "storedAt")]
    pub stored_at: i64,
}

/// Emitted whenever a key is written or removed, whether the change
/// originated locally (a `set`/`delete` call) or from a peer process
/// relaying a provider-level invalidation.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub key: String,
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The storage-level cache backend. Implementations own their own
/// connections/state; `CacheManager` is the thing application code talks
/// to, never a `CacheProvider` directly.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn dispose(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<CacheEnvelope<serde_json::Value>>>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl_seconds: Option<u64>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribes to invalidations this provider originates itself (e.g. a
    /// peer process's write, relayed over a pub/sub channel). Providers with
    /// no cross-process fan-out return a receiver nothing is ever sent on.
    fn subscribe_invalidations(&self) -> tokio::sync::broadcast::Receiver<InvalidationEvent>;
}
