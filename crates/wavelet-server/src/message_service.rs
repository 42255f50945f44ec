//! The one piece of business logic gluing storage to the outbox: writing
//! a message record and enqueueing its outbox event in a single
//! transaction, so a crash between the two is impossible by construction.

use std::sync::Arc;

use wavelet_errors::Result;
use wavelet_outbox::OutboxRepository;
use wavelet_record_adapter::PostgresRecordAdapter;

pub struct MessageService {
    records: Arc<PostgresRecordAdapter>,
    outbox: Arc<OutboxRepository>,
    namespace: String,
}

impl MessageService {
    pub fn new(records: Arc<PostgresRecordAdapter>, outbox: Arc<OutboxRepository>, namespace: impl Into<String>) -> Self {
        Self {
            records,
            outbox,
            namespace: namespace.into(),
        }
    }

    /// Commits the message record and its outbox row together. `record`
    /// must already carry `id` (the message id, stringified) for the
    /// record adapter's upsert path.
    pub async fn send(
        &self,
        conversation_id: uuid::Uuid,
        message_id: uuid::Uuid,
        record: serde_json::Value,
        outbox_payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut tx = self.records.pool().begin().await.map_err(wavelet_errors::Error::from)?;

        let stored = self
            .records
            .upsert_in_tx(&mut tx, &self.namespace, record)
            .await?;

        self.outbox
            .enqueue(&mut tx, conversation_id, message_id, "message.sent", outbox_payload)
            .await?;

        tx.commit().await.map_err(wavelet_errors::Error::from)?;
        Ok(stored)
    }
}
