//! Object-store (blob-flavored) adapter over the `object_store` crate, so
//! the same code path drives S3, GCS, Azure, or a local filesystem store
//! depending on which backend is constructed.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::{path::Path as ObjectPath, Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use sha2::{Digest, Sha256};
use wavelet_errors::Error;
use wavelet_storage_core::{BlobAdapter, PutBlob, StorageRef, StoredBlob};

const CHECKSUM_METADATA_KEY: &str = "x-wavelet-checksum-sha256";

fn key_for(reference: &StorageRef) -> ObjectPath {
    ObjectPath::from(format!("{}/{}", reference.namespace, reference.id))
}

fn checksum_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn map_object_store_error(err: object_store::Error) -> Error {
    match &err {
        object_store::Error::NotFound { .. } => Error::not_found(err.to_string()),
        _ => {
            let message = err.to_string().to_lowercase();
            if message.contains("timeout") || message.contains("timed out") {
                Error::timeout(err.to_string())
            } else if message.contains("slow down") || message.contains("throttl") || message.contains("too many requests") {
                Error::transient(err.to_string())
            } else {
                Error::new(wavelet_errors::ErrorCode::PermanentAdapterError, err.to_string())
            }
        }
    }
}

pub struct ObjectStoreBlobAdapter {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobAdapter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlobAdapter for ObjectStoreBlobAdapter {
    async fn put(&self, reference: &StorageRef, blob: PutBlob) -> Result<String, Error> {
        let checksum = checksum_hex(&blob.bytes);

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, AttributeValue::from(blob.content_type));
        attributes.insert(
            Attribute::Metadata(CHECKSUM_METADATA_KEY.into()),
            AttributeValue::from(checksum.clone()),
        );

        let result = self
            .store
            .put_opts(
                &key_for(reference),
                PutPayload::from(blob.bytes),
                PutOptions {
                    attributes,
                    ..Default::default()
                },
            )
            .await
            .map_err(map_object_store_error)?;

        let version_id = result
            .version
            .or_else(|| result.e_tag.map(|t| t.trim_matches('"').to_string()))
            .unwrap_or_else(|| {
                format!(
                    "{}:{}:{}:{}",
                    reference.namespace,
                    reference.id,
                    checksum,
                    uuid::Uuid::new_v4()
                )
            });

        Ok(version_id)
    }

    async fn get(&self, reference: &StorageRef) -> Result<StoredBlob, Error> {
        let result = self
            .store
            .get(&key_for(reference))
            .await
            .map_err(map_object_store_error)?;

        let meta = result.meta.clone();
        let attributes = result.attributes.clone();
        let bytes = result.bytes().await.map_err(map_object_store_error)?;

        let content_type = attributes
            .get(&Attribute::ContentType)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let checksum = attributes
            .get(&Attribute::Metadata(CHECKSUM_METADATA_KEY.into()))
            .map(|v| v.to_string())
            .unwrap_or_else(|| checksum_hex(&bytes));

        let version_id = meta
            .version
            .clone()
            .or_else(|| meta.e_tag.clone().map(|t| t.trim_matches('"').to_string()))
            .unwrap_or_else(|| format!("{}:{}:{}", reference.namespace, reference.id, checksum));

        Ok(StoredBlob {
            bytes: bytes.to_vec(),
            content_type,
            checksum_sha256: checksum,
            version_id,
        })
    }

    async fn delete(&self, reference: &StorageRef) -> Result<(), Error> {
        self.store
            .delete(&key_for(reference))
            .await
            .map_err(map_object_store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn adapter() -> ObjectStoreBlobAdapter {
        ObjectStoreBlobAdapter::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes_and_checksum() {
        let adapter = adapter();
        let reference = StorageRef::new("attachments", "a1");
        let blob = PutBlob {
            content_type: "text/plain".into(),
            bytes: b"hello world".to_vec(),
        };

        adapter.put(&reference, blob).await.unwrap();
        let stored = adapter.get(&reference).await.unwrap();

        assert_eq!(stored.bytes, b"hello world");
        assert_eq!(stored.content_type, "text/plain");
        assert_eq!(stored.checksum_sha256, checksum_hex(b"hello world"));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let adapter = adapter();
        let err = adapter.get(&StorageRef::new("attachments", "missing")).await.unwrap_err();
        assert_eq!(err.code, wavelet_errors::ErrorCode::NotFound);
    }
}
