use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wavelet_errors::{Error, Result};

use crate::provider::{now_millis, CacheEnvelope, CacheProvider, InvalidationEvent};

#[derive(Serialize, Deserialize)]
struct FanOutMessage {
    key: String,
    origin: String,
}

/// A Redis-backed provider. Keys are namespaced `{namespace}:{key}`; every
/// mutation publishes a `{key, origin}` message on a shared channel so
/// peer processes can drop their local copy. The subscriber ignores
/// self-originated messages and silently drops anything it can't parse.
pub struct RedisCacheProvider {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    namespace: String,
    instance_id: String,
    channel: String,
    invalidations: broadcast::Sender<InvalidationEvent>,
}

impl RedisCacheProvider {
    pub async fn connect(redis_url: &str, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let client = redis::Client::open(redis_url).map_err(Error::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(Error::from)?;
        let (invalidations, _) = broadcast::channel(256);

        Ok(Self {
            channel: format!("wavelet:cache:invalidate:{namespace}"),
            client,
            manager,
            namespace,
            instance_id: uuid::Uuid::new_v4().to_string(),
            invalidations,
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn publish_invalidation(&self, key: &str) -> Result<()> {
        let msg = FanOutMessage {
            key: key.to_string(),
            origin: self.instance_id.clone(),
        };
        let payload = serde_json::to_string(&msg).unwrap_or_default();
        let mut conn = self.manager.clone();
        let _: i64 = conn.publish(&self.channel, payload).await.map_err(Error::from)?;
        Ok(())
    }

    fn spawn_subscriber(&self) -> Result<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let instance_id = self.instance_id.clone();
        let sender = self.invalidations.clone();

        tokio::spawn(async move {
            loop {
                let conn = match client.get_async_pubsub().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "cache invalidation subscriber failed to connect, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut pubsub = conn;
                if let Err(err) = pubsub.subscribe(&channel).await {
                    tracing::warn!(error = %err, "cache invalidation subscribe failed, retrying");
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
                    let parsed: FanOutMessage = match serde_json::from_str(&payload) {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::debug!("dropped malformed cache invalidation message");
                            continue;
                        }
                    };
                    if parsed.origin == instance_id {
                        continue;
                    }
                    let _ = sender.send(InvalidationEvent { key: parsed.key });
                }
                // Stream ended (connection dropped); reconnect.
                tracing::warn!("cache invalidation subscriber stream ended, reconnecting");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl CacheProvider for RedisCacheProvider {
    async fn init(&self) -> Result<()> {
        self.spawn_subscriber()
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEnvelope<serde_json::Value>>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(self.namespaced(key)).await.map_err(Error::from)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let envelope: CacheEnvelope<serde_json::Value> = serde_json::from_str(&raw)
                    .map_err(|e| Error::validation(format!("corrupt cache envelope: {e}")))?;
                Ok(Some(envelope))
            }
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl_seconds: Option<u64>) -> Result<()> {
        let envelope = CacheEnvelope {
            value,
            stored_at: now_millis(),
        };
        let raw = serde_json::to_string(&envelope).unwrap_or_default();
        let mut conn = self.manager.clone();
        match ttl_seconds {
            Some(secs) if secs > 0 => {
                let _: () = conn
                    .set_ex(self.namespaced(key), raw, secs)
                    .await
                    .map_err(Error::from)?;
            }
            _ => {
                let _: () = conn.set(self.namespaced(key), raw).await.map_err(Error::from)?;
            }
        }
        self.publish_invalidation(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(self.namespaced(key)).await.map_err(Error::from)?;
        self.publish_invalidation(key).await
    }

    fn subscribe_invalidations(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.invalidations.subscribe()
    }
}
