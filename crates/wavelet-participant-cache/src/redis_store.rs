use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use wavelet_errors::{Error, Result};

use crate::store::{counter_key, entry_key, ParticipantInvalidation, VersionStore};

/// A `redis::aio::ConnectionManager`-backed version store. The counter is a
/// plain `INCR`; entries are JSON arrays of user ids under the versioned
/// key. Invalidations fan out on a shared pub/sub channel, the same pattern
/// the cache provider uses for its own invalidation messages.
pub struct RedisVersionStore {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    channel: String,
    invalidations: broadcast::Sender<ParticipantInvalidation>,
}

impl RedisVersionStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(Error::from)?;
        let manager = client.get_connection_manager().await.map_err(Error::from)?;
        let (invalidations, _) = broadcast::channel(256);
        Ok(Self {
            client,
            manager,
            channel: "wavelet:participants:invalidate".to_string(),
            invalidations,
        })
    }

    /// Starts the background pub/sub listener. Call once after construction.
    pub fn spawn_subscriber(&self) {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let sender = self.invalidations.clone();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "participant invalidation subscriber failed to connect, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(err) = pubsub.subscribe(&channel).await {
                    tracing::warn!(error = %err, "participant invalidation subscribe failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                use futures_util::StreamExt;
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    match serde_json::from_str::<ParticipantInvalidation>(&payload) {
                        Ok(parsed) => {
                            let _ = sender.send(parsed);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "dropped malformed participant invalidation message");
                        }
                    }
                }
                tracing::warn!("participant invalidation subscriber stream ended, reconnecting");
            }
        });
    }
}

#[async_trait]
impl VersionStore for RedisVersionStore {
    async fn current_version(&self, conversation_id: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let version: Option<i64> = conn.get(counter_key(conversation_id)).await.map_err(Error::from)?;
        Ok(version.unwrap_or(1))
    }

    async fn bump_version(&self, conversation_id: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        // Redis INCR on a key that's never been set starts at 0; the
        // counter's documented default is 1, so the first bump must land on 2.
        let exists: bool = conn.exists(counter_key(conversation_id)).await.map_err(Error::from)?;
        if !exists {
            let _: () = conn
                .set(counter_key(conversation_id), 1i64)
                .await
                .map_err(Error::from)?;
        }
        let next: i64 = conn.incr(counter_key(conversation_id), 1).await.map_err(Error::from)?;
        Ok(next)
    }

    async fn get_entry(&self, conversation_id: &str, version: i64) -> Result<Option<Vec<String>>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(entry_key(conversation_id, version))
            .await
            .map_err(Error::from)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let ids: Vec<String> = serde_json::from_str(&raw)
                    .map_err(|e| Error::validation(format!("corrupt participant entry: {e}")))?;
                Ok(Some(ids))
            }
        }
    }

    async fn set_entry(
        &self,
        conversation_id: &str,
        version: i64,
        user_ids: &[String],
        ttl_seconds: u64,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(user_ids).unwrap_or_default();
        if ttl_seconds > 0 {
            let _: () = conn
                .set_ex(entry_key(conversation_id, version), raw, ttl_seconds)
                .await
                .map_err(Error::from)?;
        } else {
            let _: () = conn
                .set(entry_key(conversation_id, version), raw)
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }

    async fn publish_invalidation(&self, conversation_id: &str, version: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        let msg = ParticipantInvalidation {
            conversation_id: conversation_id.to_string(),
            version,
        };
        let payload = serde_json::to_string(&msg).unwrap_or_default();
        let _: i64 = conn.publish(&self.channel, payload).await.map_err(Error::from)?;
        Ok(())
    }

    fn subscribe_invalidations(&self) -> broadcast::Receiver<ParticipantInvalidation> {
        self.invalidations.subscribe()
    }
}
