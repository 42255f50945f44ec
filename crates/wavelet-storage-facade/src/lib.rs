//! Namespace-to-adapter resolution plus cache orchestration.
//!
//! [`StorageFacade`] is the single entry point application code calls
//! through: every delegate call goes through [`wavelet_storage_core::guarded`]
//! for breaker/timeout/retry/metrics, and reads additionally consult a
//! [`CacheManager`] per the consistency-mode policy (strong/eventual/cache_only).

mod registry;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wavelet_breaker::{CircuitBreaker, CircuitState, RetryConfig};
use wavelet_cache::CacheManager;
use wavelet_errors::{Error, Result};
use wavelet_observability::Metrics;
use wavelet_storage_core::{
    guarded, CacheLabel, CallLabels, ConsistencyMode, Page, Pagination, ReadOptions, StorageRef,
    StreamEntry, WriteOptions,
};

pub use registry::AdapterRegistry;

#[derive(Debug, Clone, Copy)]
pub struct FacadeConfig {
    pub retry: RetryConfig,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
        }
    }
}

/// Resolves a request's namespace to an adapter, wraps every delegate call
/// in the shared breaker/timeout/retry/metrics combinator, and layers
/// read-with-cache semantics on top of record reads.
pub struct StorageFacade {
    registry: AdapterRegistry,
    cache: Option<Arc<CacheManager>>,
    breaker: Arc<CircuitBreaker>,
    metrics: Metrics,
    config: FacadeConfig,
}

impl StorageFacade {
    pub fn new(registry: AdapterRegistry, cache: Option<Arc<CacheManager>>, metrics: Metrics, config: FacadeConfig) -> Self {
        Self {
            registry,
            cache,
            breaker: Arc::new(CircuitBreaker::new(wavelet_breaker::BreakerConfig::default())),
            metrics,
            config,
        }
    }

    /// Swaps in an externally-owned breaker (e.g. from a process-wide
    /// [`CircuitBreakerRegistry`]) so its state is visible to diagnostics
    /// that only hold a handle to the registry, not to this facade.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// The process-wide breaker's current state, for `/readyz` and
    /// diagnostics to report without constructing their own probe.
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn delegate<F, Fut, T>(&self, labels: CallLabels<'_>, timeout_ms: Option<u64>, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.breaker.should_allow() {
            return Err(Error::transient(format!("storage facade circuit open for {}", labels.adapter)));
        }
        let cancel = CancellationToken::new();
        let result = guarded(
            labels,
            &self.metrics,
            Some(self.breaker.as_ref()),
            Some(self.config.retry),
            timeout_ms,
            &cancel,
            f,
        )
        .await;
        result
    }

    /// Writes a record, then invalidates the cache entry for its key —
    /// invalidate-on-write. Writes never populate the cache.
    pub async fn write_record(
        &self,
        namespace: &str,
        record: serde_json::Value,
        options: WriteOptions,
        timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value> {
        let adapter = self.registry.record(namespace)?;
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let result = self
            .delegate(
                CallLabels { op: "write_record", adapter: "record", namespace },
                timeout_ms,
                || adapter.upsert(namespace, record.clone(), options.clone()),
            )
            .await?;

        if let (Some(cache), Some(id)) = (&self.cache, &id) {
            let _ = cache.delete(&cache_key(namespace, id)).await;
        }

        Ok(result)
    }

    pub async fn delete_record(
        &self,
        reference: &StorageRef,
        options: WriteOptions,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let adapter = self.registry.record(&reference.namespace)?;
        self.delegate(
            CallLabels { op: "delete_record", adapter: "record", namespace: &reference.namespace },
            timeout_ms,
            || adapter.delete(reference, options.clone()),
        )
        .await?;

        if let Some(cache) = &self.cache {
            let _ = cache.delete(&cache_key(&reference.namespace, &reference.id)).await;
        }
        Ok(())
    }

    /// Read-with-cache, dispatching on the requested consistency mode.
    pub async fn read_record(&self, reference: &StorageRef, options: ReadOptions) -> Result<serde_json::Value> {
        let key = cache_key(&reference.namespace, &reference.id);
        let budget = options.staleness_budget_ms.unwrap_or(100);

        if options.consistency == ConsistencyMode::CacheOnly {
            let cache = self
                .cache
                .as_ref()
                .ok_or_else(|| Error::validation("cache_only read requires a configured cache"))?;
            let cached = cache.get_with_budget(&key, budget).await?;
            return match cached.value {
                Some(value) => {
                    let label = if cached.stale { CacheLabel::Stale } else { CacheLabel::Hit };
                    self.metrics.counter("facade_cache_reads_total", &label.to_string());
                    Ok(value)
                }
                None => Err(Error::not_found(format!("{}/{} not found in cache", reference.namespace, reference.id))
                    .with_metadata(serde_json::json!({"source": "cache"}))),
            };
        }

        if !options.bypass_cache {
            if let Some(cache) = &self.cache {
                let cached = cache.get_with_budget(&key, budget).await?;
                if let Some(value) = cached.value {
                    let usable = options.consistency == ConsistencyMode::Eventual || !cached.stale;
                    if usable {
                        let label = if cached.stale { CacheLabel::Stale } else { CacheLabel::Hit };
                        self.metrics.counter("facade_cache_reads_total", &label.to_string());
                        return Ok(value);
                    }
                }
            }
        }

        self.metrics.counter("facade_cache_reads_total", &CacheLabel::Miss.to_string());
        let adapter = self.registry.record(&reference.namespace)?;
        let value = self
            .delegate(
                CallLabels { op: "read_record", adapter: "record", namespace: &reference.namespace },
                options.timeout_ms,
                || adapter.get(reference),
            )
            .await?;

        if let Some(cache) = &self.cache {
            let _ = cache.set(&key, value.clone(), None).await;
        }

        Ok(value)
    }

    pub async fn query_records(
        &self,
        namespace: &str,
        query: serde_json::Value,
        pagination: Pagination,
        timeout_ms: Option<u64>,
    ) -> Result<Page<serde_json::Value>> {
        let adapter = self.registry.record(namespace)?;
        self.delegate(
            CallLabels { op: "query_records", adapter: "record", namespace },
            timeout_ms,
            || adapter.query(namespace, query.clone(), pagination.clone()),
        )
        .await
    }

    pub async fn put_blob(
        &self,
        reference: &StorageRef,
        blob: wavelet_storage_core::PutBlob,
        timeout_ms: Option<u64>,
    ) -> Result<String> {
        let adapter = self.registry.blob(&reference.namespace)?;
        self.delegate(
            CallLabels { op: "put_blob", adapter: "blob", namespace: &reference.namespace },
            timeout_ms,
            || adapter.put(reference, blob.clone()),
        )
        .await
    }

    pub async fn get_blob(&self, reference: &StorageRef, timeout_ms: Option<u64>) -> Result<wavelet_storage_core::StoredBlob> {
        let adapter = self.registry.blob(&reference.namespace)?;
        self.delegate(
            CallLabels { op: "get_blob", adapter: "blob", namespace: &reference.namespace },
            timeout_ms,
            || adapter.get(reference),
        )
        .await
    }

    pub async fn delete_blob(&self, reference: &StorageRef, timeout_ms: Option<u64>) -> Result<()> {
        let adapter = self.registry.blob(&reference.namespace)?;
        self.delegate(
            CallLabels { op: "delete_blob", adapter: "blob", namespace: &reference.namespace },
            timeout_ms,
            || adapter.delete(reference),
        )
        .await
    }

    pub async fn publish_stream(&self, namespace: &str, entry: serde_json::Value, timeout_ms: Option<u64>) -> Result<String> {
        let adapter = self.registry.stream(namespace)?;
        self.delegate(
            CallLabels { op: "publish_stream", adapter: "stream", namespace },
            timeout_ms,
            || adapter.publish(namespace, entry.clone()),
        )
        .await
    }

    /// `group`/`consumer` together name the consumer-group position the
    /// caller is reading from. The facade ensures the group exists then
    /// hands back one batch; the caller drives its own read loop rather
    /// than the facade wrapping a long-lived subscription in `guarded()`.
    pub async fn subscribe_stream_entries(
        &self,
        namespace: &str,
        group: &str,
        consumer: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let adapter = self.registry.stream(namespace)?;
        adapter.ensure_group(namespace, group).await?;
        adapter.read_batch(namespace, group, consumer, count, block_ms).await
    }
}

fn cache_key(namespace: &str, id: &str) -> String {
    format!("record:{namespace}:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use wavelet_cache::{CacheManager, CacheManagerConfig, InMemoryCacheProvider};
    use wavelet_storage_core::RecordAdapter;

    struct FakeRecordAdapter {
        reads: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl RecordAdapter for FakeRecordAdapter {
        async fn upsert(&self, _ns: &str, record: serde_json::Value, _opts: WriteOptions) -> Result<serde_json::Value> {
            Ok(record)
        }
        async fn get(&self, reference: &StorageRef) -> Result<serde_json::Value> {
            self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(serde_json::json!({"id": reference.id, "version": self.reads.load(std::sync::atomic::Ordering::SeqCst)}))
        }
        async fn delete(&self, _reference: &StorageRef, _opts: WriteOptions) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _ns: &str, _q: serde_json::Value, _p: Pagination) -> Result<Page<serde_json::Value>> {
            Ok(Page { items: vec![], next_cursor: None })
        }
    }

    fn facade_with_cache() -> StorageFacade {
        let mut registry = AdapterRegistry::new();
        registry.bind_record("blobs-ns", Arc::new(FakeRecordAdapter { reads: Default::default() }));
        let cache = Arc::new(CacheManager::new(
            Arc::new(InMemoryCacheProvider::new(100)),
            CacheManagerConfig::default(),
            Metrics::new("facade-test"),
        ));
        StorageFacade::new(registry, Some(cache), Metrics::new("facade-test"), FacadeConfig::default())
    }

    #[tokio::test]
    async fn strong_read_bypass_always_hits_backend() {
        let facade = facade_with_cache();
        let reference = StorageRef::new("blobs-ns", "r1");

        let first = facade
            .read_record(&reference, ReadOptions { bypass_cache: true, ..Default::default() })
            .await
            .unwrap();
        let second = facade
            .read_record(&reference, ReadOptions { bypass_cache: true, ..Default::default() })
            .await
            .unwrap();

        assert_ne!(first["version"], second["version"]);
    }

    #[tokio::test]
    async fn eventual_read_serves_stale_cache_without_hitting_backend() {
        let facade = facade_with_cache();
        let reference = StorageRef::new("blobs-ns", "r1");

        let first = facade
            .read_record(&reference, ReadOptions::default())
            .await
            .unwrap();
        let second = facade
            .read_record(
                &reference,
                ReadOptions { consistency: ConsistencyMode::Eventual, ..Default::default() },
            )
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn write_invalidates_cache_entry() {
        let facade = facade_with_cache();
        let reference = StorageRef::new("blobs-ns", "r1");
        let _ = facade.read_record(&reference, ReadOptions::default()).await.unwrap();

        facade
            .write_record("blobs-ns", serde_json::json!({"id": "r1"}), WriteOptions::default(), None)
            .await
            .unwrap();

        let after_write = facade
            .read_record(&reference, ReadOptions { bypass_cache: true, ..Default::default() })
            .await
            .unwrap();
        let cached_again = facade
            .read_record(&reference, ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(after_write, cached_again);
    }

    #[tokio::test]
    async fn unknown_namespace_surfaces_unknown_error() {
        let facade = facade_with_cache();
        let reference = StorageRef::new("unbound-ns", "r1");
        let err = facade.read_record(&reference, ReadOptions::default()).await.unwrap_err();
        assert_eq!(err.code, wavelet_errors::ErrorCode::Unknown);
    }
}
