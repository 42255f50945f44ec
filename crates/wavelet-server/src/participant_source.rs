//! The read port [`wavelet_authz::ParticipantSource`] falls back to on a
//! cache miss: conversation membership and roles, both stored as a single
//! record per conversation rather than their own adapter, since they share
//! the same consistency and query shape as any other structured row.

use std::sync::Arc;

use async_trait::async_trait;
use wavelet_errors::{ErrorCode, Result};
use wavelet_storage_core::{ReadOptions, StorageRef};
use wavelet_storage_facade::StorageFacade;

const NAMESPACE: &str = "conversation_participants";

pub struct FacadeParticipantSource {
    facade: Arc<StorageFacade>,
}

impl FacadeParticipantSource {
    pub fn new(facade: Arc<StorageFacade>) -> Self {
        Self { facade }
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<serde_json::Value>> {
        let reference = StorageRef::new(NAMESPACE, conversation_id);
        match self.facade.read_record(&reference, ReadOptions::default()).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.code == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl wavelet_authz::ParticipantSource for FacadeParticipantSource {
    async fn active_participants(&self, conversation_id: &str) -> Result<Vec<String>> {
        let record = self.load(conversation_id).await?;
        Ok(record
            .as_ref()
            .and_then(|r| r.get("userIds"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default())
    }

    async fn role_of(&self, conversation_id: &str, user_id: &str) -> Result<Option<String>> {
        let record = self.load(conversation_id).await?;
        Ok(record
            .as_ref()
            .and_then(|r| r.get("roles"))
            .and_then(|roles| roles.get(user_id))
            .and_then(|v| v.as_str())
            .map(String::from))
    }
}
