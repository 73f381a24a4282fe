//! `SinkEngine`: buffers typed rows derived from `DomainEvent`s, flushes in
//! bounded batches with upsert semantics, and checkpoints progress (spec
//! §4.6).

use std::sync::Arc;
use std::time::{Duration, Instant};

use stage_core::error::RetryAdvice;
use stage_core::governance::retry::compute_backoff;
use stage_core::observability::MetricsRegistry;
use stage_core::{CoreError, DomainEvent};
use stage_cursor::{CounterDelta, CursorStore};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::metrics::{SinkMetrics, SinkMetricsSnapshot};
use crate::row::{RowMapper, SinkRow};
use crate::sink::Sink;

struct PendingState {
    rows: Vec<SinkRow>,
    last_flush: Instant,
}

pub struct SinkEngine {
    sink: Arc<dyn Sink>,
    mapper: Arc<dyn RowMapper>,
    cursor_store: Arc<CursorStore>,
    metrics: Arc<SinkMetrics>,
    shared_metrics: MetricsRegistry,
    batch_size: usize,
    commit_interval: Duration,
    pending: Mutex<PendingState>,
}

impl SinkEngine {
    /// `shared_metrics` is the process-wide registry `GET /metrics` renders
    /// from; flush latency is folded into its `processing_latency_seconds`
    /// histogram alongside the runtime's own batch-publish samples, so a
    /// sink-backed deployment's latency is actually visible there instead
    /// of being stranded in `SinkMetrics`, which only the control-plane
    /// heartbeat reads via `metrics()`.
    pub fn new(
        sink: Arc<dyn Sink>,
        mapper: Arc<dyn RowMapper>,
        cursor_store: Arc<CursorStore>,
        shared_metrics: MetricsRegistry,
        batch_size: usize,
        commit_interval: Duration,
    ) -> Self {
        Self {
            sink,
            mapper,
            cursor_store,
            metrics: Arc::new(SinkMetrics::default()),
            shared_metrics,
            batch_size,
            commit_interval,
            pending: Mutex::new(PendingState {
                rows: Vec::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn metrics(&self) -> SinkMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Maps `event` into rows, appends them to the pending buffer, and
    /// triggers a flush once the buffer fills or the commit interval has
    /// elapsed (spec §4.6 `Ingest`).
    pub async fn ingest(&self, event: &DomainEvent) -> Result<(), CoreError> {
        let rows = self.mapper.map_event(event)?;
        self.metrics.record_received(rows.len() as u64);

        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.rows.extend(rows);
            pending.rows.len() >= self.batch_size || pending.last_flush.elapsed() >= self.commit_interval
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commits the pending buffer in one transaction, retrying transient
    /// failures with exponential backoff up to the default retry budget.
    /// Exhausting retries leaves the buffer untouched and returns an
    /// error, so the caller can terminate the session without having
    /// committed a partial batch (spec §4.6 "no partial-durable rows").
    pub async fn flush(&self) -> Result<(), CoreError> {
        let mut pending = self.pending.lock().await;
        if pending.rows.is_empty() {
            return Ok(());
        }

        let advice = RetryAdvice::default();
        let started = Instant::now();
        let mut last_err = None;

        for attempt in 0..advice.max_attempts {
            match self.sink.upsert_batch(&pending.rows).await {
                Ok(()) => {
                    let written = pending.rows.len() as u64;
                    let last_sequence = pending.rows.iter().map(|r| r.cursor).max().unwrap_or(0);
                    let delta = CounterDelta {
                        ledgers: 0,
                        events: written,
                    };
                    self.cursor_store.update(last_sequence, 0, delta).await;
                    if let Err(err) = self.cursor_store.save().await {
                        warn!(err = %err, "coalesced cursor save failed after sink flush");
                    }

                    let elapsed = started.elapsed();
                    self.metrics.record_flush_success(written, elapsed.as_millis() as u64, last_sequence);
                    self.shared_metrics.processing_latency_seconds().observe(elapsed.as_secs_f64());
                    pending.rows.clear();
                    pending.last_flush = Instant::now();
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, err = %err, "sink flush failed, retrying");
                    let backoff = compute_backoff(attempt, Duration::from_millis(0), advice.base);
                    tokio::time::sleep(backoff).await;
                    last_err = Some(err);
                }
            }
        }

        let failed = pending.rows.len() as u64;
        self.metrics.record_flush_failure(failed);
        let err = last_err.unwrap_or(CoreError::Persistence(Box::new(std::io::Error::other(
            "sink flush exhausted retries",
        ))));
        error!(err = %err, "sink flush exhausted retries, halting session");
        Err(err)
    }

    /// Final flush, cursor save, connection close (spec §4.6 `Close`).
    pub async fn close(&self) -> Result<(), CoreError> {
        self.flush().await?;
        self.cursor_store.save().await.map_err(|e| CoreError::Persistence(Box::new(e)))?;
        self.sink.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DefaultRowMapper;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink {
        fail_first_n: AtomicU32,
        pub calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl Sink for CountingSink {
        async fn upsert_batch(&self, _rows: &[SinkRow]) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first_n.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n - 1)
                }
            });
            if remaining.is_ok() {
                return Err(CoreError::Persistence(Box::new(std::io::Error::other("transient"))));
            }
            Ok(())
        }
    }

    struct AlwaysFailsSink;

    #[async_trait::async_trait]
    impl Sink for AlwaysFailsSink {
        async fn upsert_batch(&self, _rows: &[SinkRow]) -> Result<(), CoreError> {
            Err(CoreError::Persistence(Box::new(std::io::Error::other("down"))))
        }
    }

    async fn engine_with(sink: Arc<dyn Sink>, batch_size: usize) -> SinkEngine {
        let dir = tempfile::tempdir().unwrap();
        let cursor_store = Arc::new(CursorStore::open(dir.path().join("cursor.json"), "sink-test").await);
        std::mem::forget(dir);
        SinkEngine::new(
            sink,
            Arc::new(DefaultRowMapper),
            cursor_store,
            MetricsRegistry::new("test_sink"),
            batch_size,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn ingest_flushes_once_batch_size_is_reached() {
        let sink = Arc::new(CountingSink {
            fail_first_n: AtomicU32::new(0),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let engine = engine_with(sink.clone(), 2).await;

        engine.ingest(&DomainEvent::builder("stellar.token.transfer.v1", 1, 0, "t").build()).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        engine.ingest(&DomainEvent::builder("stellar.token.transfer.v1", 2, 0, "t").build()).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        let snapshot = engine.metrics();
        assert_eq!(snapshot.events_written, 2);
        assert_eq!(snapshot.batches_flushed, 1);
        assert_eq!(snapshot.last_written_sequence, 2);
    }

    #[tokio::test]
    async fn flush_retries_transient_failures_then_succeeds() {
        let sink = Arc::new(CountingSink {
            fail_first_n: AtomicU32::new(2),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let engine = engine_with(sink.clone(), 1).await;

        engine.ingest(&DomainEvent::builder("stellar.token.transfer.v1", 10, 0, "t").build()).await.unwrap();

        let snapshot = engine.metrics();
        assert_eq!(snapshot.events_written, 1);
        assert_eq!(snapshot.events_failed, 0);
        assert_eq!(snapshot.batches_flushed, 1);
        assert!(sink.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_error_without_clearing_buffer() {
        let engine = engine_with(Arc::new(AlwaysFailsSink), 1).await;
        let result = engine
            .ingest(&DomainEvent::builder("stellar.token.transfer.v1", 20, 0, "t").build())
            .await;
        assert!(result.is_err());
        let snapshot = engine.metrics();
        assert_eq!(snapshot.events_written, 0);
        assert_eq!(snapshot.events_failed, 1);
    }

    #[tokio::test]
    async fn close_flushes_remaining_rows() {
        let sink = Arc::new(CountingSink {
            fail_first_n: AtomicU32::new(0),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let engine = engine_with(sink.clone(), 1000).await;
        engine.ingest(&DomainEvent::builder("stellar.token.transfer.v1", 30, 0, "t").build()).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        engine.close().await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }
}
