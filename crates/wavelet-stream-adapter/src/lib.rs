//! Append-only log-broker (stream-flavored) adapter over Redis Streams.
//!
//! Stream keys are `{stream_prefix}:{namespace}:stream`; consumer groups are
//! named `{group_prefix}:{group}:{namespace}:stream`, keeping both
//! namespace-scoped and free of collisions across logical groups.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisError, Value};
use wavelet_errors::{Error, Result};
use wavelet_storage_core::{StreamAdapter, StreamEntry};

pub struct RedisStreamAdapter {
    manager: ConnectionManager,
    stream_prefix: String,
    group_prefix: String,
    max_len_approx: u64,
}

impl RedisStreamAdapter {
    pub async fn connect(redis_url: &str, stream_prefix: impl Into<String>, group_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(Error::from)?;
        let manager = client.get_connection_manager().await.map_err(Error::from)?;
        Ok(Self {
            manager,
            stream_prefix: stream_prefix.into(),
            group_prefix: group_prefix.into(),
            max_len_approx: 100_000,
        })
    }

    pub fn with_max_len(mut self, max_len_approx: u64) -> Self {
        self.max_len_approx = max_len_approx;
        self
    }

    fn stream_key(&self, namespace: &str) -> String {
        format!("{}:{}:stream", self.stream_prefix, namespace)
    }

    fn group_key(&self, group: &str, namespace: &str) -> String {
        format!("{}:{}:{}:stream", self.group_prefix, group, namespace)
    }

    fn is_busygroup(err: &RedisError) -> bool {
        err.to_string().contains("BUSYGROUP")
    }

    fn is_nogroup(err: &RedisError) -> bool {
        err.to_string().contains("NOGROUP")
    }
}

fn parse_stream_entries(reply: Value, stream_key: &str) -> Result<Vec<StreamEntry>> {
    // Shape: [[stream_key, [[entry_id, [field, value, ...]], ...]], ...]
    let Value::Array(streams) = reply else {
        return Ok(Vec::new());
    };

    for stream in streams {
        let Value::Array(parts) = stream else { continue };
        if parts.len() != 2 {
            continue;
        }
        let Value::BulkString(ref name) = parts[0] else { continue };
        if String::from_utf8_lossy(name) != stream_key {
            continue;
        }

        let Value::Array(ref entries) = parts[1] else { continue };
        return entries.iter().map(parse_single_entry).collect();
    }

    Ok(Vec::new())
}

fn parse_single_entry(entry: &Value) -> Result<StreamEntry> {
    let Value::Array(parts) = entry else {
        return Err(Error::new(wavelet_errors::ErrorCode::ConsistencyError, "malformed stream entry shape"));
    };
    if parts.len() != 2 {
        return Err(Error::new(wavelet_errors::ErrorCode::ConsistencyError, "malformed stream entry shape"));
    }

    let id = bulk_string(&parts[0]).unwrap_or_default();

    let Value::Array(ref fields) = parts[1] else {
        return Err(Error::new(wavelet_errors::ErrorCode::ConsistencyError, "malformed stream entry fields"));
    };

    let mut message_id = String::new();
    let mut conversation_id = String::new();
    let mut payload = serde_json::Value::Null;

    let mut i = 0;
    while i + 1 < fields.len() {
        let key = bulk_string(&fields[i]).unwrap_or_default();
        let value = bulk_string(&fields[i + 1]).unwrap_or_default();
        match key.as_str() {
            "message_id" => message_id = value,
            "conversation_id" => conversation_id = value,
            "payload" => {
                payload = serde_json::from_str(&value).map_err(|e| {
                    Error::new(
                        wavelet_errors::ErrorCode::ConsistencyError,
                        format!("malformed stream payload in entry {id}: {e}"),
                    )
                    .with_metadata(serde_json::json!({"entryId": id}))
                })?;
            }
            _ => {}
        }
        i += 2;
    }

    Ok(StreamEntry {
        id,
        message_id,
        conversation_id,
        payload,
    })
}

fn bulk_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

#[async_trait]
impl StreamAdapter for RedisStreamAdapter {
    async fn publish(&self, namespace: &str, entry: serde_json::Value) -> Result<String> {
        let message_id = entry.get("messageId").and_then(|v| v.as_str()).unwrap_or_default();
        let conversation_id = entry.get("conversationId").and_then(|v| v.as_str()).unwrap_or_default();
        let payload = entry.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        let payload_json = serde_json::to_string(&payload).unwrap_or_default();

        let mut conn = self.manager.clone();
        let id: String = redis::cmd("XADD")
            .arg(self.stream_key(namespace))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len_approx)
            .arg("*")
            .arg("message_id")
            .arg(message_id)
            .arg("conversation_id")
            .arg(conversation_id)
            .arg("payload")
            .arg(payload_json)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        Ok(id)
    }

    async fn ensure_group(&self, namespace: &str, group: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let result: std::result::Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(namespace))
            .arg(self.group_key(group, namespace))
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if Self::is_busygroup(&err) => Ok(()),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn read_batch(
        &self,
        namespace: &str,
        group: &str,
        consumer: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let stream_key = self.stream_key(namespace);
        let mut conn = self.manager.clone();
        let result: std::result::Result<Value, RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(self.group_key(group, namespace))
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Value::Nil) => Ok(Vec::new()),
            Ok(reply) => parse_stream_entries(reply, &stream_key),
            Err(err) if Self::is_nogroup(&err) => Err(Error::new(
                wavelet_errors::ErrorCode::ConsistencyError,
                format!("consumer group missing for {stream_key}: {err}"),
            )),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn ack(&self, namespace: &str, group: &str, entry_ids: &[String]) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(self.stream_key(namespace))
            .arg(self.group_key(group, namespace))
            .arg(entry_ids)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn autoclaim(
        &self,
        namespace: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: u32,
    ) -> Result<Vec<StreamEntry>> {
        let stream_key = self.stream_key(namespace);
        let mut conn = self.manager.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&stream_key)
            .arg(self.group_key(group, namespace))
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        // Shape: [next_cursor, [[entry_id, [field, value, ...]], ...], [deleted_ids...]]
        let Value::Array(parts) = reply else {
            return Ok(Vec::new());
        };
        let Some(Value::Array(entries)) = parts.into_iter().nth(1) else {
            return Ok(Vec::new());
        };
        entries.iter().map(parse_single_entry).collect()
    }

    async fn pending_count(&self, namespace: &str, group: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(self.stream_key(namespace))
            .arg(self.group_key(group, namespace))
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        if let Value::Array(parts) = reply {
            if let Some(Value::Int(count)) = parts.first() {
                return Ok((*count).max(0) as u64);
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_entry_fields() {
        let entry = Value::Array(vec![
            Value::BulkString(b"1-0".to_vec()),
            Value::Array(vec![
                Value::BulkString(b"message_id".to_vec()),
                Value::BulkString(b"m1".to_vec()),
                Value::BulkString(b"conversation_id".to_vec()),
                Value::BulkString(b"c1".to_vec()),
                Value::BulkString(b"payload".to_vec()),
                Value::BulkString(br#"{"seq":1}"#.to_vec()),
            ]),
        ]);

        let parsed = parse_single_entry(&entry).unwrap();
        assert_eq!(parsed.id, "1-0");
        assert_eq!(parsed.message_id, "m1");
        assert_eq!(parsed.conversation_id, "c1");
        assert_eq!(parsed.payload["seq"], 1);
    }

    #[test]
    fn malformed_payload_surfaces_consistency_error_with_entry_id() {
        let entry = Value::Array(vec![
            Value::BulkString(b"2-0".to_vec()),
            Value::Array(vec![
                Value::BulkString(b"payload".to_vec()),
                Value::BulkString(b"not json".to_vec()),
            ]),
        ]);

        let err = parse_single_entry(&entry).unwrap_err();
        assert_eq!(err.code, wavelet_errors::ErrorCode::ConsistencyError);
        assert_eq!(err.metadata["entryId"], "2-0");
    }
}
