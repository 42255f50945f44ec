use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wavelet_breaker::{BreakerConfig, CircuitBreaker, RetryConfig};
use wavelet_errors::{Error, Result};
use wavelet_observability::Metrics;

use crate::provider::{now_millis, CacheProvider, InvalidationEvent};

#[derive(Debug, Clone, Copy)]
pub struct CacheManagerConfig {
    pub ttl_seconds: u64,
    pub staleness_budget_ms: i64,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 60,
            staleness_budget_ms: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub value: Option<serde_json::Value>,
    pub stale: bool,
}

/// Wraps a [`CacheProvider`] with metrics, an optional breaker/retry, and a
/// fan-in invalidation channel that merges local writes with anything the
/// provider relays from peer processes.
pub struct CacheManager {
    provider: Arc<dyn CacheProvider>,
    config: CacheManagerConfig,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryConfig>,
    metrics: Metrics,
    local_invalidations: broadcast::Sender<InvalidationEvent>,
}

impl CacheManager {
    pub fn new(provider: Arc<dyn CacheProvider>, config: CacheManagerConfig, metrics: Metrics) -> Self {
        let (local_invalidations, _) = broadcast::channel(256);
        Self {
            provider,
            config,
            breaker: None,
            retry: None,
            metrics,
            local_invalidations,
        }
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = Some(CircuitBreaker::new(config));
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// A single stream of invalidations: local `set`/`delete` calls plus
    /// anything the provider relays from peers. Callers (e.g. a participant
    /// cache layered on top) subscribe once at construction.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.local_invalidations.subscribe()
    }

    pub async fn init(&self) -> Result<()> {
        self.provider.init().await?;
        let mut remote = self.provider.subscribe_invalidations();
        let local = self.local_invalidations.clone();
        tokio::spawn(async move {
            loop {
                match remote.recv().await {
                    Ok(event) => {
                        let _ = local.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    fn guard_allows(&self) -> bool {
        self.breaker.as_ref().map(|b| b.should_allow()).unwrap_or(true)
    }

    fn record_outcome(&self, ok: bool) {
        if let Some(breaker) = &self.breaker {
            if ok {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    async fn execute<F, Fut, T>(&self, op: &str, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.guard_allows() {
            tracing::warn!(op, "cache operation rejected: circuit open");
            self.metrics.counter("cache_requests_total", op);
            return Err(Error::transient("cache circuit open"));
        }

        let result = match self.retry {
            Some(cfg) => wavelet_breaker::retry(cfg, cancel, |e| e.retryable(), &f).await,
            None => f().await,
        };

        self.metrics.counter("cache_requests_total", op);
        self.record_outcome(result.is_ok());
        if let Err(err) = &result {
            tracing::warn!(op, error = %err, "cache operation failed");
        }
        result
    }

    pub async fn get(&self, key: &str) -> Result<GetResult> {
        self.get_with_budget(key, self.config.staleness_budget_ms).await
    }

    pub async fn get_with_budget(&self, key: &str, staleness_budget_ms: i64) -> Result<GetResult> {
        let cancel = CancellationToken::new();
        let envelope = self
            .execute("get", &cancel, || async { self.provider.get(key).await })
            .await?;

        match envelope {
            None => {
                tracing::debug!(key, "cache miss");
                Ok(GetResult { value: None, stale: false })
            }
            Some(envelope) => {
                let stale = (now_millis() - envelope.stored_at) > staleness_budget_ms;
                Ok(GetResult {
                    value: Some(envelope.value),
                    stale,
                })
            }
        }
    }

    pub async fn set(&self, key: &str, value: serde_json::Value, ttl_seconds: Option<u64>) -> Result<()> {
        let cancel = CancellationToken::new();
        let ttl = ttl_seconds.unwrap_or(self.config.ttl_seconds);
        self.execute("set", &cancel, || async {
            self.provider.set(key, value.clone(), Some(ttl)).await
        })
        .await?;
        let _ = self.local_invalidations.send(InvalidationEvent { key: key.to_string() });
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let cancel = CancellationToken::new();
        self.execute("delete", &cancel, || async { self.provider.delete(key).await })
            .await?;
        let _ = self.local_invalidations.send(InvalidationEvent { key: key.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCacheProvider;
    use std::time::Duration;

    fn manager() -> CacheManager {
        let provider = Arc::new(InMemoryCacheProvider::new(100));
        CacheManager::new(provider, CacheManagerConfig::default(), Metrics::new("cache"))
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_is_fresh() {
        let cache = manager();
        cache.set("k1", serde_json::json!({"a": 1}), None).await.unwrap();
        let result = cache.get("k1").await.unwrap();
        assert_eq!(result.value.unwrap(), serde_json::json!({"a": 1}));
        assert!(!result.stale);
    }

    #[tokio::test]
    async fn delete_makes_key_absent() {
        let cache = manager();
        cache.set("k1", serde_json::json!(1), None).await.unwrap();
        cache.delete("k1").await.unwrap();
        let result = cache.get("k1").await.unwrap();
        assert!(result.value.is_none());
    }

    #[tokio::test]
    async fn stale_after_budget_elapses() {
        let cache = CacheManager::new(
            Arc::new(InMemoryCacheProvider::new(100)),
            CacheManagerConfig {
                ttl_seconds: 60,
                staleness_budget_ms: 0,
            },
            Metrics::new("cache"),
        );
        cache.set("k1", serde_json::json!(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = cache.get("k1").await.unwrap();
        assert!(result.stale);
    }

    #[tokio::test]
    async fn set_emits_local_invalidation() {
        let cache = manager();
        let mut rx = cache.subscribe_invalidations();
        cache.set("k1", serde_json::json!(1), None).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "k1");
    }
}
