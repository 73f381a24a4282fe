//! The `Sink` abstraction (spec §9 "Dynamic dispatch, sink"): a backing
//! store capable of durably upserting a batch of [`SinkRow`]s. `SinkEngine`
//! is generic over this trait so the same buffering/retry/cursor logic
//! drives any concrete backend.

use std::time::Duration;

use stage_core::CoreError;

use crate::row::SinkRow;

#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Upserts every row in `rows` in a single transaction. Must be
    /// all-or-nothing: a partial failure must not leave some rows
    /// committed and others not (spec §4.6 "no partial-durable rows").
    async fn upsert_batch(&self, rows: &[SinkRow]) -> Result<(), CoreError>;

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Postgres-backed reference implementation (spec §4.6).
pub struct PostgresSink {
    pool: sqlx::PgPool,
}

impl PostgresSink {
    /// Connects with the pool bounds spec §4.6 calls out explicitly: 25
    /// max connections, 5 idle, 5-minute max lifetime.
    pub async fn connect(database_url: &str) -> Result<Self, CoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(25)
            .min_connections(5)
            .max_lifetime(Duration::from_secs(300))
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Persistence(Box::new(e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Sink for PostgresSink {
    async fn upsert_batch(&self, rows: &[SinkRow]) -> Result<(), CoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| CoreError::Persistence(Box::new(e)))?;

        for row in rows {
            let payload = row.columns.get("payload").cloned().unwrap_or(serde_json::Value::Null);
            let metadata = row.columns.get("metadata").cloned().unwrap_or(serde_json::Value::Null);

            sqlx::query(
                "INSERT INTO domain_events \
                 (event_id, event_type, cursor, intra_ledger_index, content_type, payload, metadata, source_component_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (event_id) DO UPDATE SET \
                    event_type = EXCLUDED.event_type, \
                    cursor = EXCLUDED.cursor, \
                    intra_ledger_index = EXCLUDED.intra_ledger_index, \
                    content_type = EXCLUDED.content_type, \
                    payload = EXCLUDED.payload, \
                    metadata = EXCLUDED.metadata, \
                    source_component_id = EXCLUDED.source_component_id",
            )
            .bind(&row.primary_key)
            .bind(row.column_str("event_type"))
            .bind(row.cursor as i64)
            .bind(row.columns.get("intra_ledger_index").and_then(|v| v.as_i64()).unwrap_or(0))
            .bind(row.column_str("content_type"))
            .bind(sqlx::types::Json(payload))
            .bind(sqlx::types::Json(metadata))
            .bind(row.column_str("source_component_id"))
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::Persistence(Box::new(e)))?;
        }

        tx.commit().await.map_err(|e| CoreError::Persistence(Box::new(e)))
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Stand-in for a columnar, analytical sink (spec §9: "Arrow-Flight
/// columnar vs per-event gRPC … a processor may publish on both").
///
/// Writes each flushed batch as newline-delimited JSON under `directory`,
/// one file per flush. This is not a real Parquet/DuckLake writer; it
/// exists so `SinkEngine` can be exercised against a second `Sink`
/// implementation without a Postgres instance.
pub struct ParquetSink {
    directory: std::path::PathBuf,
}

impl ParquetSink {
    pub fn new(directory: impl Into<std::path::PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait::async_trait]
impl Sink for ParquetSink {
    async fn upsert_batch(&self, rows: &[SinkRow]) -> Result<(), CoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| CoreError::Persistence(Box::new(e)))?;

        let first_cursor = rows.first().map(|r| r.cursor).unwrap_or(0);
        let path = self.directory.join(format!("batch-{first_cursor:020}.ndjson"));

        let mut buffer = String::new();
        for row in rows {
            let line = serde_json::json!({
                "primary_key": row.primary_key,
                "cursor": row.cursor,
                "columns": row.columns,
            });
            buffer.push_str(&line.to_string());
            buffer.push('\n');
        }

        tokio::fs::write(&path, buffer)
            .await
            .map_err(|e| CoreError::Persistence(Box::new(e)))
    }
}
