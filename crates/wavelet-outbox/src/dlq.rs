use chrono::{DateTime, Utc};
use sqlx::PgPool;
use wavelet_breaker::CircuitBreaker;
use wavelet_errors::{Error, Result};

const MAX_ERROR_LEN: usize = 1000;

/// Writes poison messages that the consumer or dispatcher gave up on.
/// Wrapped in its own breaker because a DLQ outage must never block an ack
/// or a dispatcher tick; callers log-and-continue on failure here.
pub struct DlqWriter {
    pool: PgPool,
    breaker: CircuitBreaker,
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub source_stream: String,
    pub group_name: String,
    pub event_id: String,
    pub aggregate_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub reason: String,
}

impl DlqWriter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            breaker: CircuitBreaker::new(wavelet_breaker::BreakerConfig::default()),
        }
    }

    pub async fn bootstrap(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_dlq (
                source_stream TEXT NOT NULL,
                group_name TEXT NOT NULL,
                event_id TEXT NOT NULL UNIQUE,
                aggregate_id TEXT,
                occurred_at TIMESTAMPTZ,
                payload JSONB NOT NULL,
                reason TEXT NOT NULL,
                attempts INT NOT NULL DEFAULT 1,
                last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    /// Best-effort write. Returns `Err` rather than panicking so callers can
    /// count the failure, but must never let that error block an ack.
    pub async fn write(&self, entry: DlqEntry) -> Result<()> {
        if !self.breaker.should_allow() {
            return Err(Error::transient("dlq writer circuit open"));
        }

        let reason: String = entry.reason.chars().take(MAX_ERROR_LEN).collect();

        let result = sqlx::query(
            "INSERT INTO outbox_dlq (source_stream, group_name, event_id, aggregate_id, occurred_at, payload, reason, attempts, last_seen_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 1, now())
             ON CONFLICT (event_id) DO UPDATE
             SET attempts = outbox_dlq.attempts + 1, last_seen_at = now(), reason = EXCLUDED.reason",
        )
        .bind(&entry.source_stream)
        .bind(&entry.group_name)
        .bind(&entry.event_id)
        .bind(&entry.aggregate_id)
        .bind(entry.occurred_at)
        .bind(&entry.payload)
        .bind(&reason)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(Error::from(err))
            }
        }
    }
}
