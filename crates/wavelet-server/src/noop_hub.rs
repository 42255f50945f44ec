//! A placeholder [`Hub`] for wiring the consumer up without a real
//! WebSocket fan-out layer attached — that layer is an external
//! collaborator this crate only specifies the trait boundary for.

use async_trait::async_trait;
use wavelet_hub::{BroadcastError, Envelope, Hub};

pub struct LoggingHub;

#[async_trait]
impl Hub for LoggingHub {
    async fn broadcast(&self, envelope: Envelope) -> Result<(), BroadcastError> {
        tracing::debug!(message_id = %envelope.id, "broadcast (no socket hub attached)");
        Ok(())
    }
}
