use async_trait::async_trait;
use wavelet_errors::Result;

use crate::models::{Page, Pagination, StorageRef, WriteOptions};

/// A structured-record (SQL-flavored) adapter. `namespace` scopes rows the
/// way a tenant or a logical table would.
#[async_trait]
pub trait RecordAdapter: Send + Sync {
    async fn upsert(
        &self,
        namespace: &str,
        record: serde_json::Value,
        options: WriteOptions,
    ) -> Result<serde_json::Value>;

    async fn get(&self, reference: &StorageRef) -> Result<serde_json::Value>;

    async fn delete(&self, reference: &StorageRef, options: WriteOptions) -> Result<()>;

    async fn query(
        &self,
        namespace: &str,
        query: serde_json::Value,
        pagination: Pagination,
    ) -> Result<Page<serde_json::Value>>;
}

#[derive(Debug, Clone)]
pub struct PutBlob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub checksum_sha256: String,
    pub version_id: String,
}

/// An object-store (blob-flavored) adapter, keyed `{namespace}/{id}`.
#[async_trait]
pub trait BlobAdapter: Send + Sync {
    async fn put(&self, reference: &StorageRef, blob: PutBlob) -> Result<String>;
    async fn get(&self, reference: &StorageRef) -> Result<StoredBlob>;
    async fn delete(&self, reference: &StorageRef) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub payload: serde_json::Value,
}

/// An append-only log-broker (stream-flavored) adapter.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    async fn publish(&self, namespace: &str, entry: serde_json::Value) -> Result<String>;

    /// Ensures the consumer group exists; idempotent.
    async fn ensure_group(&self, namespace: &str, group: &str) -> Result<()>;

    async fn read_batch(
        &self,
        namespace: &str,
        group: &str,
        consumer: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, namespace: &str, group: &str, entry_ids: &[String]) -> Result<()>;

    async fn autoclaim(
        &self,
        namespace: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: u32,
    ) -> Result<Vec<StreamEntry>>;

    async fn pending_count(&self, namespace: &str, group: &str) -> Result<u64>;
}
