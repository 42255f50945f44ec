//! Structured-record (SQL-flavored) adapter backed by Postgres.
//!
//! One `records` table per schema, namespaced by a `namespace` column, with
//! optimistic concurrency via a `version_id` generated on every write.

use async_trait::async_trait;
use regex::Regex;
use sqlx::{PgPool, Row};
use wavelet_errors::{Error, Result};
use wavelet_storage_core::{Cursor, Page, Pagination, RecordAdapter, StorageRef, WriteOptions};

fn map_sql_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        // statement_timeout / query_canceled
        if db_err.code().as_deref() == Some("57014") {
            return Error::timeout(db_err.message().to_string());
        }
    }
    Error::from(err)
}

fn valid_identifier(name: &str) -> bool {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());
    re.is_match(name)
}

pub struct PostgresRecordAdapter {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PostgresRecordAdapter {
    /// Validates the schema/table identifiers eagerly; construction fails
    /// `ValidationFailed` rather than letting an injected identifier reach
    /// a query string later.
    pub fn new(pool: PgPool, schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let table = table.into();
        if !valid_identifier(&schema) || !valid_identifier(&table) {
            return Err(Error::validation(
                "record adapter schema/table identifiers must match ^[A-Za-z0-9_]+$",
            ));
        }
        Ok(Self { pool, schema, table })
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Exposes the pool so transactional callers (message send) can open
    /// their own transaction spanning this adapter and another table.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent schema bootstrap: the schema, the `records` table, and a
    /// namespace index. Safe to call on every process start.
    pub async fn bootstrap(&self) -> Result<()> {
        let schema_sql = format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema);
        sqlx::query(&schema_sql).execute(&self.pool).await.map_err(map_sql_error)?;

        let table_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                namespace TEXT NOT NULL,
                id TEXT NOT NULL,
                version_id TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (namespace, id)
            )",
            self.qualified_table()
        );
        sqlx::query(&table_sql).execute(&self.pool).await.map_err(map_sql_error)?;

        let index_sql = format!(
            "CREATE INDEX IF NOT EXISTS {}_namespace_id_idx ON {} (namespace, id)",
            self.table,
            self.qualified_table()
        );
        sqlx::query(&index_sql).execute(&self.pool).await.map_err(map_sql_error)?;

        Ok(())
    }
}

impl PostgresRecordAdapter {
    /// Same upsert as [`RecordAdapter::upsert`], but runs on a caller-owned
    /// transaction instead of the adapter's own pool — for callers (like
    /// message send) that need the record write and an outbox append to
    /// commit or roll back together. Always an insert-or-replace; there's
    /// no concurrency-token path since this is only used for fresh inserts.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut sqlx::PgConnection,
        namespace: &str,
        record: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::validation("record.id must be a non-empty string"))?
            .to_string();

        let version_id = uuid::Uuid::new_v4().to_string();

        let sql = format!(
            "INSERT INTO {} (namespace, id, version_id, data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (namespace, id)
             DO UPDATE SET version_id = EXCLUDED.version_id, data = EXCLUDED.data, updated_at = now()
             RETURNING data",
            self.qualified_table()
        );
        let row = sqlx::query(&sql)
            .bind(namespace)
            .bind(&id)
            .bind(&version_id)
            .bind(&record)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sql_error)?;

        Ok(row.try_get::<serde_json::Value, _>("data").map_err(map_sql_error)?)
    }
}

#[async_trait]
impl RecordAdapter for PostgresRecordAdapter {
    async fn upsert(
        &self,
        namespace: &str,
        record: serde_json::Value,
        options: WriteOptions,
    ) -> Result<serde_json::Value> {
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::validation("record.id must be a non-empty string"))?
            .to_string();

        let version_id = uuid::Uuid::new_v4().to_string();

        if let Some(token) = options.concurrency_token {
            let sql = format!(
                "UPDATE {} SET version_id = $1, data = $2, updated_at = now()
                 WHERE namespace = $3 AND id = $4 AND version_id = $5
                 RETURNING data",
                self.qualified_table()
            );
            let row = sqlx::query(&sql)
                .bind(&version_id)
                .bind(&record)
                .bind(namespace)
                .bind(&id)
                .bind(&token)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sql_error)?;

            return match row {
                Some(row) => Ok(row.try_get::<serde_json::Value, _>("data").map_err(map_sql_error)?),
                None => Err(Error::precondition_failed(format!(
                    "concurrency token mismatch for {namespace}/{id}"
                ))),
            };
        }

        let sql = format!(
            "INSERT INTO {} (namespace, id, version_id, data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (namespace, id)
             DO UPDATE SET version_id = EXCLUDED.version_id, data = EXCLUDED.data, updated_at = now()
             RETURNING data",
            self.qualified_table()
        );
        let row = sqlx::query(&sql)
            .bind(namespace)
            .bind(&id)
            .bind(&version_id)
            .bind(&record)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sql_error)?;

        Ok(row.try_get::<serde_json::Value, _>("data").map_err(map_sql_error)?)
    }

    async fn get(&self, reference: &StorageRef) -> Result<serde_json::Value> {
        let sql = format!(
            "SELECT data FROM {} WHERE namespace = $1 AND id = $2",
            self.qualified_table()
        );
        let row = sqlx::query(&sql)
            .bind(&reference.namespace)
            .bind(&reference.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sql_error)?;

        match row {
            Some(row) => Ok(row.try_get::<serde_json::Value, _>("data").map_err(map_sql_error)?),
            None => Err(Error::not_found(format!(
                "{}/{} not found",
                reference.namespace, reference.id
            ))),
        }
    }

    async fn delete(&self, reference: &StorageRef, options: WriteOptions) -> Result<()> {
        if let Some(token) = options.concurrency_token {
            let sql = format!(
                "DELETE FROM {} WHERE namespace = $1 AND id = $2 AND version_id = $3",
                self.qualified_table()
            );
            let result = sqlx::query(&sql)
                .bind(&reference.namespace)
                .bind(&reference.id)
                .bind(&token)
                .execute(&self.pool)
                .await
                .map_err(map_sql_error)?;

            if result.rows_affected() > 0 {
                return Ok(());
            }

            let exists_sql = format!(
                "SELECT 1 FROM {} WHERE namespace = $1 AND id = $2",
                self.qualified_table()
            );
            let still_exists = sqlx::query(&exists_sql)
                .bind(&reference.namespace)
                .bind(&reference.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sql_error)?
                .is_some();

            return if still_exists {
                Err(Error::precondition_failed(format!(
                    "concurrency token mismatch deleting {}/{}",
                    reference.namespace, reference.id
                )))
            } else {
                Err(Error::not_found(format!(
                    "{}/{} not found",
                    reference.namespace, reference.id
                )))
            };
        }

        let sql = format!(
            "DELETE FROM {} WHERE namespace = $1 AND id = $2",
            self.qualified_table()
        );
        let result = sqlx::query(&sql)
            .bind(&reference.namespace)
            .bind(&reference.id)
            .execute(&self.pool)
            .await
            .map_err(map_sql_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "{}/{} not found",
                reference.namespace, reference.id
            )));
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        query: serde_json::Value,
        pagination: Pagination,
    ) -> Result<Page<serde_json::Value>> {
        let limit = pagination.limit.unwrap_or(50).max(1) as i64;
        let last_id = match pagination.cursor {
            Some(raw) => Some(Cursor::decode(&raw)?.last_id),
            None => None,
        };
        let filter = query.as_object().filter(|o| !o.is_empty()).map(|_| query.clone());

        let sql = format!(
            "SELECT id, data FROM {} WHERE namespace = $1
             AND ($2::text IS NULL OR id > $2)
             AND ($3::jsonb IS NULL OR data @> $3)
             ORDER BY id ASC LIMIT $4",
            self.qualified_table()
        );

        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(&last_id)
            .bind(&filter)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sql_error)?;

        let mut items: Vec<(String, serde_json::Value)> = rows
            .into_iter()
            .map(|row| {
                let id: String = row.try_get("id").unwrap_or_default();
                let data: serde_json::Value = row.try_get("data").unwrap_or_default();
                (id, data)
            })
            .collect();

        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            items.last().map(|(id, _)| Cursor { last_id: id.clone() }.encode())
        } else {
            None
        };

        Ok(Page {
            items: items.into_iter().map(|(_, data)| data).collect(),
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::valid_identifier;

    #[test]
    fn accepts_alnum_underscore_identifiers() {
        assert!(valid_identifier("messaging_records"));
        assert!(!valid_identifier("messaging-records"));
        assert!(!valid_identifier("drop table;"));
    }
}
