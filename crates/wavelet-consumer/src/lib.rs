//! Reads the broker stream in batches, reorders per conversation,
//! deduplicates by message id, fans out to [`wavelet_hub::Hub`], and
//! reclaims work abandoned by crashed peers.
//!
//! [`Consumer`] owns exactly one logical cursor into `(stream, group,
//! consumer_name)`; running two instances against the same triple violates
//! the broker's pending-entry-ownership guarantee and isn't this crate's job
//! to prevent.

mod buffer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use wavelet_errors::Result;
use wavelet_hub::{BroadcastError, Envelope, Hub, MessageData};
use wavelet_observability::Metrics;
use wavelet_outbox::{DlqEntry, DlqWriter};
use wavelet_storage_core::{StreamAdapter, StreamEntry};

pub use buffer::DropPolicy;
use buffer::{PendingEntry, ReorderBuffer};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream_namespace: String,
    pub group: String,
    pub consumer_name: String,
    pub batch_size: u32,
    pub block_ms: u64,
    pub pel_hygiene_interval: Duration,
    pub min_idle_ms: u64,
    pub max_queue: usize,
    pub drop_policy: DropPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_namespace: "messages".to_string(),
            group: "delivery".to_string(),
            consumer_name: "consumer-1".to_string(),
            batch_size: 128,
            block_ms: 1000,
            pel_hygiene_interval: Duration::from_secs(30),
            min_idle_ms: 30_000,
            max_queue: 100,
            drop_policy: DropPolicy::DropNew,
        }
    }
}

struct State {
    delivered: HashSet<String>,
    buffers: HashMap<String, ReorderBuffer>,
}

pub struct Consumer {
    stream: Arc<dyn StreamAdapter>,
    hub: Arc<dyn Hub>,
    dlq: Arc<DlqWriter>,
    state: Mutex<State>,
    metrics: Metrics,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        stream: Arc<dyn StreamAdapter>,
        hub: Arc<dyn Hub>,
        dlq: Arc<DlqWriter>,
        metrics: Metrics,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            stream,
            hub,
            dlq,
            state: Mutex::new(State {
                delivered: HashSet::new(),
                buffers: HashMap::new(),
            }),
            metrics,
            config,
        }
    }

    pub async fn ensure_group(&self) -> Result<()> {
        self.stream.ensure_group(&self.config.stream_namespace, &self.config.group).await
    }

    /// One `XREADGROUP` batch: parse, buffer, then drain every touched
    /// conversation. Parse failures are dead-lettered and acked immediately;
    /// they never enter a reorder buffer.
    pub async fn poll_once(&self) -> Result<()> {
        let entries = self
            .stream
            .read_batch(
                &self.config.stream_namespace,
                &self.config.group,
                &self.config.consumer_name,
                self.config.batch_size,
                self.config.block_ms,
            )
            .await?;

        if entries.is_empty() {
            return Ok(());
        }

        let mut touched = HashSet::new();
        let mut parse_failures = Vec::new();
        let mut dropped_ids = Vec::new();
        {
            let mut state = self.state.lock().await;
            for entry in entries {
                match parse_payload(&entry) {
                    Ok(pending) => {
                        let conversation_id = pending.data.conversation_id.clone();
                        let buffer = state
                            .buffers
                            .entry(conversation_id.clone())
                            .or_insert_with(|| ReorderBuffer::new(self.config.max_queue, self.config.drop_policy));
                        if let Some(dropped) = buffer.push(pending) {
                            self.metrics.counter("ws_dropped_total", drop_reason(self.config.drop_policy));
                            dropped_ids.push(dropped.broker_id);
                        }
                        touched.insert(conversation_id);
                    }
                    None => parse_failures.push(entry),
                }
            }
        }

        for entry in &parse_failures {
            self.dead_letter_parse_failure(entry).await;
        }

        // A dropped entry's broker delivery already happened; ack it
        // directly rather than routing it back through `drain_conversation`.
        if !dropped_ids.is_empty() {
            if let Err(err) = self.stream.ack(&self.config.stream_namespace, &self.config.group, &dropped_ids).await {
                tracing::warn!(error = %err, "failed to ack dropped entries, broker will redeliver");
            }
        }

        for conversation_id in touched {
            self.drain_conversation(&conversation_id).await?;
        }

        Ok(())
    }

    async fn dead_letter_parse_failure(&self, entry: &StreamEntry) {
        self.metrics.counter("consumer_failures_total", "parse_error");
        let aggregate_id = entry
            .payload
            .get("conversationId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| (!entry.conversation_id.is_empty()).then(|| entry.conversation_id.clone()));

        let write_result = self
            .dlq
            .write(DlqEntry {
                source_stream: self.config.stream_namespace.clone(),
                group_name: self.config.group.clone(),
                event_id: entry.id.clone(),
                aggregate_id,
                occurred_at: None,
                payload: entry.payload.clone(),
                reason: "parse_error".to_string(),
            })
            .await;
        if let Err(err) = write_result {
            tracing::warn!(error = %err, broker_id = entry.id, "dlq write failed for parse_error entry");
        }

        if let Err(err) = self
            .stream
            .ack(&self.config.stream_namespace, &self.config.group, &[entry.id.clone()])
            .await
        {
            tracing::warn!(error = %err, broker_id = entry.id, "failed to ack a poison entry, broker will redeliver");
        }
    }

    /// Sorts the conversation's buffer by `seq`, delivers in order, and acks
    /// everything it finished with in one call. A transient broadcast error
    /// stops the conversation's drain immediately; the remaining entries
    /// (including the one that failed) go back into the buffer unacked, so
    /// the broker's PEL keeps them for redelivery.
    async fn drain_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let buffer = match state.buffers.get_mut(conversation_id) {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        let entries = buffer.drain_sorted();

        let mut to_ack = Vec::new();
        let mut remaining = Vec::new();
        let mut stopped = false;

        let mut iter = entries.into_iter();
        for pending in &mut iter {
            if stopped {
                remaining.push(pending);
                continue;
            }

            if state.delivered.contains(&pending.data.message_id) {
                to_ack.push(pending.broker_id.clone());
                continue;
            }

            let envelope = Envelope::for_message(pending.data.clone(), pending.seq);
            match self.hub.broadcast(envelope).await {
                Ok(()) => {
                    state.delivered.insert(pending.data.message_id.clone());
                    to_ack.push(pending.broker_id.clone());
                }
                Err(BroadcastError::Permanent(reason)) => {
                    self.metrics.counter("consumer_failures_total", "permanent_error");
                    let write_result = self
                        .dlq
                        .write(DlqEntry {
                            source_stream: self.config.stream_namespace.clone(),
                            group_name: self.config.group.clone(),
                            event_id: pending.broker_id.clone(),
                            aggregate_id: Some(pending.data.conversation_id.clone()),
                            occurred_at: None,
                            payload: pending.raw_payload.clone(),
                            reason: format!("permanent_error: {reason}"),
                        })
                        .await;
                    if let Err(err) = write_result {
                        tracing::warn!(error = %err, broker_id = pending.broker_id, "dlq write failed for permanent_error entry");
                    }
                    to_ack.push(pending.broker_id.clone());
                }
                Err(BroadcastError::Transient(reason)) => {
                    tracing::debug!(conversation_id, broker_id = pending.broker_id, reason, "transient broadcast failure, pausing conversation");
                    stopped = true;
                    remaining.push(pending);
                }
            }
        }

        buffer.push_front_all(remaining);

        drop(state);

        if !to_ack.is_empty() {
            if let Err(err) = self.stream.ack(&self.config.stream_namespace, &self.config.group, &to_ack).await {
                tracing::warn!(error = %err, conversation_id, "ack failed, broker will redeliver");
            }
        }

        Ok(())
    }

    /// Reclaims entries idle past `min_idle_ms` from dead peers and updates
    /// the PEL-size gauge. Reclaimed entries are fed through the same
    /// parse/buffer/drain pipeline as a fresh read.
    pub async fn pel_hygiene_tick(&self) -> Result<()> {
        let reclaimed = self
            .stream
            .autoclaim(
                &self.config.stream_namespace,
                &self.config.group,
                &self.config.consumer_name,
                self.config.min_idle_ms,
                100,
            )
            .await?;

        if !reclaimed.is_empty() {
            let mut touched = HashSet::new();
            {
                let mut state = self.state.lock().await;
                for entry in reclaimed {
                    match parse_payload(&entry) {
                        Ok(pending) => {
                            let conversation_id = pending.data.conversation_id.clone();
                            let buffer = state
                                .buffers
                                .entry(conversation_id.clone())
                                .or_insert_with(|| ReorderBuffer::new(self.config.max_queue, self.config.drop_policy));
                            buffer.push(pending);
                            touched.insert(conversation_id);
                        }
                        None => self.dead_letter_parse_failure(&entry).await,
                    }
                }
            }
            for conversation_id in touched {
                self.drain_conversation(&conversation_id).await?;
            }
        }

        let pending_count = self.stream.pending_count(&self.config.stream_namespace, &self.config.group).await?;
        self.metrics.set_gauge("consumer_pel_size", &self.config.consumer_name, pending_count as f64);
        Ok(())
    }

    /// Drains every non-empty reorder buffer one last time. Called on
    /// shutdown, after the read loops have already stopped.
    pub async fn drain_all(&self) {
        let conversation_ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .buffers
                .iter()
                .filter(|(_, buffer)| !buffer.is_empty())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for conversation_id in conversation_ids {
            if let Err(err) = self.drain_conversation(&conversation_id).await {
                tracing::error!(error = %err, conversation_id, "final drain failed");
            }
        }
    }
}

fn drop_reason(policy: DropPolicy) -> &'static str {
    match policy {
        DropPolicy::DropNew => "drop_new",
        DropPolicy::DropOld => "drop_old",
    }
}

fn parse_payload(entry: &StreamEntry) -> Option<PendingEntry> {
    let payload = &entry.payload;
    let message_id = payload.get("messageId").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
    let conversation_id = payload.get("conversationId").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
    let ciphertext = payload.get("ciphertext").and_then(|v| v.as_str());

    let (message_id, conversation_id, ciphertext) = match (message_id, conversation_id, ciphertext) {
        (Some(m), Some(c), Some(ct)) => (m.to_string(), c.to_string(), ct.to_string()),
        _ => return None,
    };

    let seq = payload.get("seq").and_then(|v| v.as_u64());
    let occurred_at = payload
        .get("occurredAt")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_default();
    let metadata = payload.get("metadata").cloned();
    let content_size = payload.get("contentSize").and_then(|v| v.as_u64());
    let content_mime_type = payload.get("contentMimeType").and_then(|v| v.as_str()).map(String::from);

    Some(PendingEntry {
        broker_id: entry.id.clone(),
        seq,
        data: MessageData {
            message_id,
            conversation_id,
            ciphertext,
            metadata,
            content_size,
            content_mime_type,
            occurred_at,
        },
        raw_payload: payload.clone(),
    })
}

/// A cooperative pair of background loops: the main read/deliver loop and
/// the PEL hygiene loop, both cancellation-aware. Mirrors the dispatcher's
/// runner shape.
pub struct Runner {
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    hygiene_handle: tokio::task::JoinHandle<()>,
    consumer: Arc<Consumer>,
}

impl Runner {
    /// `cancel` is normally a shutdown coordinator's per-stage token, so
    /// the coordinator's own cancellation drains this loop without the
    /// caller needing to call [`Runner::stop`] as well.
    pub async fn start(consumer: Arc<Consumer>, cancel: CancellationToken) -> Result<Self> {
        consumer.ensure_group().await?;

        let read_cancel = cancel.clone();
        let read_consumer = consumer.clone();
        let read_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    result = read_consumer.poll_once() => {
                        if let Err(err) = result {
                            tracing::error!(error = %err, "consumer poll failed");
                        }
                    }
                }
            }
        });

        let hygiene_cancel = cancel.clone();
        let hygiene_consumer = consumer.clone();
        let hygiene_interval = consumer.config.pel_hygiene_interval;
        let hygiene_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hygiene_cancel.cancelled() => break,
                    _ = tokio::time::sleep(hygiene_interval) => {
                        if let Err(err) = hygiene_consumer.pel_hygiene_tick().await {
                            tracing::error!(error = %err, "pel hygiene tick failed");
                        }
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            read_handle,
            hygiene_handle,
            consumer,
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.read_handle.await;
        let _ = self.hygiene_handle.await;
        self.consumer.drain_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStream {
        batches: Mutex<Vec<Vec<StreamEntry>>>,
        acked: Mutex<Vec<String>>,
    }

    impl FakeStream {
        fn new(batches: Vec<Vec<StreamEntry>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                acked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamAdapter for FakeStream {
        async fn publish(&self, _: &str, _: serde_json::Value) -> Result<String> {
            Ok("0-0".to_string())
        }
        async fn ensure_group(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn read_batch(&self, _: &str, _: &str, _: &str, _: u32, _: u64) -> Result<Vec<StreamEntry>> {
            let mut batches = self.batches.lock().await;
            Ok(if batches.is_empty() { Vec::new() } else { batches.remove(0) })
        }
        async fn ack(&self, _: &str, _: &str, entry_ids: &[String]) -> Result<()> {
            self.acked.lock().await.extend(entry_ids.iter().cloned());
            Ok(())
        }
        async fn autoclaim(&self, _: &str, _: &str, _: &str, _: u64, _: u32) -> Result<Vec<StreamEntry>> {
            Ok(Vec::new())
        }
        async fn pending_count(&self, _: &str, _: &str) -> Result<u64> {
            Ok(0)
        }
    }

    struct CountingHub {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Hub for CountingHub {
        async fn broadcast(&self, _envelope: Envelope) -> std::result::Result<(), BroadcastError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stream_entry(id: &str, message_id: &str, conversation_id: &str, seq: Option<u64>) -> StreamEntry {
        let mut payload = serde_json::json!({
            "v": 1,
            "messageId": message_id,
            "conversationId": conversation_id,
            "ciphertext": "ZW5jcnlwdGVk",
            "occurredAt": "2026-07-28T00:00:00Z",
        });
        if let Some(seq) = seq {
            payload["seq"] = serde_json::json!(seq);
        }
        StreamEntry {
            id: id.to_string(),
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            payload,
        }
    }

    fn dlq_writer() -> Arc<DlqWriter> {
        // No sqlx::test pool in a unit test; these paths only exercise
        // parse-success flows that never reach the DLQ.
        Arc::new(DlqWriter::new(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy("postgres://localhost/does-not-matter")
                .unwrap(),
        ))
    }

    #[tokio::test]
    async fn duplicate_delivery_of_the_same_message_id_broadcasts_once() {
        let entries = vec![
            stream_entry("200-0", "m1", "c1", None),
            stream_entry("200-1", "m1", "c1", None),
        ];
        let stream = Arc::new(FakeStream::new(vec![entries]));
        let hub = Arc::new(CountingHub { calls: AtomicUsize::new(0) });
        let consumer = Consumer::new(
            stream.clone(),
            hub.clone(),
            dlq_writer(),
            Metrics::new("consumer"),
            ConsumerConfig::default(),
        );

        consumer.poll_once().await.unwrap();

        assert_eq!(hub.calls.load(Ordering::SeqCst), 1);
        let acked = stream.acked.lock().await.clone();
        assert_eq!(acked, vec!["200-0".to_string(), "200-1".to_string()]);
    }

    #[tokio::test]
    async fn entries_are_delivered_in_seq_order_within_a_conversation() {
        struct OrderRecordingHub {
            order: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl Hub for OrderRecordingHub {
            async fn broadcast(&self, envelope: Envelope) -> std::result::Result<(), BroadcastError> {
                self.order.lock().await.push(envelope.payload.data.message_id);
                Ok(())
            }
        }

        let entries = vec![
            stream_entry("1-0", "m3", "c1", Some(3)),
            stream_entry("1-1", "m1", "c1", Some(1)),
            stream_entry("1-2", "m2", "c1", Some(2)),
        ];
        let stream = Arc::new(FakeStream::new(vec![entries]));
        let hub = Arc::new(OrderRecordingHub { order: Mutex::new(Vec::new()) });
        let consumer = Consumer::new(
            stream,
            hub.clone(),
            dlq_writer(),
            Metrics::new("consumer"),
            ConsumerConfig::default(),
        );

        consumer.poll_once().await.unwrap();

        let order = hub.order.lock().await.clone();
        assert_eq!(order, vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]);
    }

    #[tokio::test]
    async fn transient_broadcast_error_leaves_remaining_entries_unacked() {
        struct FlakyHub {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl Hub for FlakyHub {
            async fn broadcast(&self, _envelope: Envelope) -> std::result::Result<(), BroadcastError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(())
                } else {
                    Err(BroadcastError::Transient("socket backpressure".to_string()))
                }
            }
        }

        let entries = vec![
            stream_entry("1-0", "m1", "c1", Some(1)),
            stream_entry("1-1", "m2", "c1", Some(2)),
        ];
        let stream = Arc::new(FakeStream::new(vec![entries]));
        let hub = Arc::new(FlakyHub { calls: AtomicUsize::new(0) });
        let consumer = Consumer::new(
            stream.clone(),
            hub,
            dlq_writer(),
            Metrics::new("consumer"),
            ConsumerConfig::default(),
        );

        consumer.poll_once().await.unwrap();

        let acked = stream.acked.lock().await.clone();
        assert_eq!(acked, vec!["1-0".to_string()]);
    }
}
