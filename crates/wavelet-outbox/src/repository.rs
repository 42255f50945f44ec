use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use wavelet_errors::{Error, Result};

const MAX_ERROR_LEN: usize = 1000;

fn truncate_error(err: &str) -> String {
    err.chars().take(MAX_ERROR_LEN).collect()
}

/// The stable set of values the `status` column takes. Kept as a type for
/// callers outside this crate that want to match on it instead of a raw
/// string; the repository itself stores and compares status as SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Picked,
    Sent,
    Dead,
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_id: uuid::Uuid,
    pub message_id: uuid::Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub occurred_at: DateTime<Utc>,
    pub picked_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn bootstrap(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                aggregate_id UUID NOT NULL,
                message_id UUID NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'picked', 'sent', 'dead')),
                attempts INT NOT NULL DEFAULT 0,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                picked_at TIMESTAMPTZ,
                dispatched_at TIMESTAMPTZ,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS outbox_pending_idx ON outbox (occurred_at, id) WHERE status = 'pending'")
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;

        Ok(())
    }

    /// Enqueues a new outbox row in state `pending`. Called from within the
    /// same transaction as the business write the event describes.
    pub async fn enqueue(
        &self,
        executor: &mut sqlx::PgConnection,
        aggregate_id: uuid::Uuid,
        message_id: uuid::Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO outbox (aggregate_id, message_id, event_type, payload, status, attempts, occurred_at)
             VALUES ($1, $2, $3, $4, 'pending', 0, now())
             RETURNING id",
        )
        .bind(aggregate_id)
        .bind(message_id)
        .bind(event_type)
        .bind(&payload)
        .fetch_one(executor)
        .await
        .map_err(Error::from)?;

        row.try_get::<i64, _>("id").map_err(Error::from)
    }

    /// Claims up to `limit` pending rows, oldest first, and flips them to
    /// `picked` in the same transaction. `FOR UPDATE SKIP LOCKED` guarantees
    /// no two concurrent dispatchers ever claim the same row.
    pub async fn fetch_batch(&self, limit: i64) -> Result<Vec<OutboxRow>> {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;

        let picked: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM outbox
             WHERE status = 'pending'
             ORDER BY occurred_at ASC, id ASC
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::from)?;

        if picked.is_empty() {
            tx.commit().await.map_err(Error::from)?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = picked.into_iter().map(|(id,)| id).collect();

        let rows: Vec<OutboxRow> = sqlx::query_as(
            "UPDATE outbox
             SET status = 'picked', picked_at = now(), attempts = attempts + 1
             WHERE id = ANY($1)
             RETURNING id, aggregate_id, message_id, event_type, payload, status,
                       attempts, occurred_at, picked_at, dispatched_at, last_error",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::from)?;

        tx.commit().await.map_err(Error::from)?;
        Ok(rows)
    }

    pub async fn mark_sent(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE outbox SET status = 'sent', dispatched_at = now(), last_error = NULL
             WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    /// Idempotent by row id: returning a `pending` row to `pending` again is
    /// a no-op beyond refreshing `last_error`.
    pub async fn mark_failed(&self, ids: &[i64], err: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox SET status = 'pending', last_error = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(truncate_error(err))
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    pub async fn bury(&self, ids: &[i64], err: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox SET status = 'dead', last_error = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(truncate_error(err))
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_errors_to_max_length() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
    }
}
