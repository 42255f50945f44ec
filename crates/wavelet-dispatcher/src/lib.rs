//! Drains the transactional outbox onto the broker stream.
//!
//! [`Dispatcher::tick`] is one claim-publish-settle pass; [`Runner`] ticks it
//! on a cadence as a cancellation-aware background task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wavelet_breaker::{CircuitBreaker, CircuitState};
use wavelet_errors::Result;
use wavelet_observability::Metrics;
use wavelet_outbox::{OutboxRepository, OutboxRow};
use wavelet_storage_core::StreamAdapter;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub max_attempts: i32,
    pub cadence: Duration,
    pub stream_namespace: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            max_attempts: 10,
            cadence: Duration::from_millis(200),
            stream_namespace: "messages".to_string(),
        }
    }
}

pub struct Dispatcher {
    outbox: Arc<OutboxRepository>,
    stream: Arc<dyn StreamAdapter>,
    breaker: Arc<CircuitBreaker>,
    metrics: Metrics,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        outbox: Arc<OutboxRepository>,
        stream: Arc<dyn StreamAdapter>,
        metrics: Metrics,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            stream,
            breaker: Arc::new(CircuitBreaker::new(wavelet_breaker::BreakerConfig::default())),
            metrics,
            config,
        }
    }

    /// Swaps in an externally-owned breaker (e.g. from a process-wide
    /// [`wavelet_breaker`]-based registry) so its state is visible to
    /// diagnostics that only hold a handle to the registry.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// The per-call publish breaker's current state, for `/readyz` and
    /// diagnostics.
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Runs one claim-publish-settle pass. Never returns `Err` for
    /// per-row publish failures; only a failure to talk to the outbox
    /// table itself propagates, since the runner must keep ticking either
    /// way.
    pub async fn tick(&self) -> Result<()> {
        let started = Instant::now();
        let batch = self.outbox.fetch_batch(self.config.batch_size).await?;

        if batch.is_empty() {
            self.metrics.counter("dispatcher_ticks_total", "empty");
            return Ok(());
        }

        let mut successes = Vec::new();
        let mut failures: Vec<(OutboxRow, String)> = Vec::new();

        for row in batch {
            match self.publish_row(&row).await {
                Ok(()) => successes.push(row.id),
                Err(err) => failures.push((row, err.message)),
            }
        }

        self.outbox.mark_sent(&successes).await?;

        let mut to_retry = Vec::new();
        let mut to_bury = Vec::new();
        for (row, err) in failures {
            if row.attempts >= self.config.max_attempts {
                to_bury.push(row.id);
                tracing::warn!(outbox_id = row.id, attempts = row.attempts, "burying outbox row after max attempts");
            } else {
                tracing::debug!(outbox_id = row.id, attempts = row.attempts, error = %err, "outbox row publish failed, will retry");
                to_retry.push(row.id);
            }
        }

        if !to_bury.is_empty() {
            self.outbox.bury(&to_bury, "max_attempts_exceeded").await?;
        }
        if !to_retry.is_empty() {
            self.outbox.mark_failed(&to_retry, "publish_failed").await?;
        }

        self.metrics.counter("dispatcher_ticks_total", "non_empty");
        self.metrics.record_latency(
            "dispatcher_tick_duration_seconds",
            "tick",
            started.elapsed().as_secs_f64(),
        );

        Ok(())
    }

    async fn publish_row(&self, row: &OutboxRow) -> Result<()> {
        if !self.breaker.should_allow() {
            return Err(wavelet_errors::Error::transient("dispatcher breaker open"));
        }

        let entry = serde_json::json!({
            "messageId": row.message_id,
            "conversationId": row.aggregate_id,
            "payload": row.payload,
        });

        let result = self.stream.publish(&self.config.stream_namespace, entry).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result.map(|_| ())
    }
}

/// A cooperative loop that ticks a [`Dispatcher`] on a cadence. Per-tick
/// errors are logged and counted, never propagated out of the loop.
pub struct Runner {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Runner {
    /// `cancel` is normally a shutdown coordinator's per-stage token, so
    /// the coordinator's own cancellation drains this loop without the
    /// caller needing to call [`Runner::stop`] as well.
    pub fn start(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Self {
        let loop_cancel = cancel.clone();
        let cadence = dispatcher.config.cadence;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    result = dispatcher.tick() => {
                        if let Err(err) = result {
                            tracing::error!(error = %err, "dispatcher tick failed");
                            dispatcher.metrics.counter("dispatcher_ticks_total", "error");
                        }
                    }
                }

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(cadence) => {}
                }
            }
        });

        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
