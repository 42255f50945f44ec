use std::collections::HashMap;
use std::sync::Arc;

use wavelet_errors::{Error, ErrorCode, Result};
use wavelet_storage_core::{BlobAdapter, RecordAdapter, StreamAdapter};

/// Resolves a namespace to the adapter bound to it. A namespace binding's
/// wildcard ("*") or list form is expanded into concrete keys by whoever
/// builds the registry at boot; lookups here are a plain map hit.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    records: HashMap<String, Arc<dyn RecordAdapter>>,
    blobs: HashMap<String, Arc<dyn BlobAdapter>>,
    streams: HashMap<String, Arc<dyn StreamAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_record(&mut self, namespace: impl Into<String>, adapter: Arc<dyn RecordAdapter>) {
        self.records.insert(namespace.into(), adapter);
    }

    pub fn bind_blob(&mut self, namespace: impl Into<String>, adapter: Arc<dyn BlobAdapter>) {
        self.blobs.insert(namespace.into(), adapter);
    }

    pub fn bind_stream(&mut self, namespace: impl Into<String>, adapter: Arc<dyn StreamAdapter>) {
        self.streams.insert(namespace.into(), adapter);
    }

    pub fn record(&self, namespace: &str) -> Result<Arc<dyn RecordAdapter>> {
        self.records
            .get(namespace)
            .cloned()
            .ok_or_else(|| unknown_namespace(namespace))
    }

    pub fn blob(&self, namespace: &str) -> Result<Arc<dyn BlobAdapter>> {
        self.blobs
            .get(namespace)
            .cloned()
            .ok_or_else(|| unknown_namespace(namespace))
    }

    pub fn stream(&self, namespace: &str) -> Result<Arc<dyn StreamAdapter>> {
        self.streams
            .get(namespace)
            .cloned()
            .ok_or_else(|| unknown_namespace(namespace))
    }
}

fn unknown_namespace(namespace: &str) -> Error {
    Error::new(ErrorCode::Unknown, format!("no adapter bound for namespace '{namespace}'"))
        .with_metadata(serde_json::json!({ "namespace": namespace }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wavelet_storage_core::{Page, Pagination, StorageRef, WriteOptions};

    struct NoopRecordAdapter;

    #[async_trait]
    impl RecordAdapter for NoopRecordAdapter {
        async fn upsert(&self, _: &str, record: serde_json::Value, _: WriteOptions) -> Result<serde_json::Value> {
            Ok(record)
        }
        async fn get(&self, _: &StorageRef) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
        async fn delete(&self, _: &StorageRef, _: WriteOptions) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _: &str, _: serde_json::Value, _: Pagination) -> Result<Page<serde_json::Value>> {
            Ok(Page { items: vec![], next_cursor: None })
        }
    }

    #[test]
    fn unknown_namespace_carries_namespace_in_metadata() {
        let registry = AdapterRegistry::new();
        let err = registry.record("conversations").unwrap_err();
        assert_eq!(err.code, ErrorCode::Unknown);
        assert_eq!(err.metadata["namespace"], "conversations");
    }

    #[test]
    fn bound_namespace_resolves() {
        let mut registry = AdapterRegistry::new();
        registry.bind_record("conversations", Arc::new(NoopRecordAdapter));
        assert!(registry.record("conversations").is_ok());
    }
}
