//! Per-stream state and accounting for published Arrow streams (spec §4.5
//! "Per-stream accounting").

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stage_core::CoreError;
use stage_fanout::BoundedFanout;
use tokio::sync::{Notify, RwLock};

/// Counters returned by `GetFlightInfo`/`CloseStream`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub entries_served: u64,
    pub bytes_served: u64,
}

pub struct StreamState {
    pub schema: SchemaRef,
    pub fanout: Arc<BoundedFanout<RecordBatch>>,
    pub created_at: DateTime<Utc>,
    pub last_activity: RwLock<DateTime<Utc>>,
    pub close_signal: Notify,
    entries_served: AtomicU64,
    bytes_served: AtomicU64,
    consecutive_drops: AtomicU32,
}

impl StreamState {
    fn new(schema: SchemaRef, capacity: usize) -> Self {
        Self {
            schema,
            fanout: Arc::new(BoundedFanout::new(capacity)),
            created_at: Utc::now(),
            last_activity: RwLock::new(Utc::now()),
            close_signal: Notify::new(),
            entries_served: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
            consecutive_drops: AtomicU32::new(0),
        }
    }

    /// Sums every column's resident buffer size (spec §4.5: "Bytes are
    /// derived from the batch's column buffer sizes"). Using
    /// `get_array_memory_size` on every column, including nested children
    /// and null bitmaps, rather than a single top-level estimate, so
    /// variable-width columns (strings, lists) are accounted correctly.
    pub fn batch_byte_size(batch: &RecordBatch) -> usize {
        batch.columns().iter().map(|column| column.get_array_memory_size()).sum()
    }

    pub async fn record_served(&self, batch: &RecordBatch) {
        self.entries_served.fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        self.bytes_served
            .fetch_add(Self::batch_byte_size(batch) as u64, Ordering::Relaxed);
        *self.last_activity.write().await = Utc::now();
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            entries_served: self.entries_served.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }
}

const DEFAULT_STREAM_CAPACITY: usize = 100;

/// Registry of published streams, keyed by stream id. One entry per
/// logical stream; `DoGet` registers a fanout consumer against the
/// matching entry, `AddBatch` publishes into it.
#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<String, Arc<StreamState>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_stream(&self, stream_id: impl Into<String>, schema: SchemaRef) {
        let stream_id = stream_id.into();
        self.streams
            .entry(stream_id)
            .or_insert_with(|| Arc::new(StreamState::new(schema, DEFAULT_STREAM_CAPACITY)));
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamState>> {
        self.streams.get(stream_id).map(|entry| entry.value().clone())
    }

    pub fn list_stream_ids(&self) -> Vec<String> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Enqueues `batch` to the stream's fanout, applying drop-oldest on
    /// overflow. Two consecutive `AddBatch` calls that both had to drop
    /// return `Busy` (spec §4.5 "on second failure, return Busy").
    pub fn add_batch(&self, stream_id: &str, batch: RecordBatch) -> Result<(), CoreError> {
        let stream = self
            .streams
            .get(stream_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown stream {stream_id}")))?;
        let dropped = stream.fanout.publish(batch) > 0;
        if dropped {
            let consecutive = stream.consecutive_drops.fetch_add(1, Ordering::SeqCst) + 1;
            if consecutive >= 2 {
                return Err(CoreError::Downstream(format!("stream {stream_id} is busy")));
            }
        } else {
            stream.consecutive_drops.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Cancels the stream, wakes any blocked `DoGet` consumers, and
    /// returns the final accounting totals.
    pub fn close_stream(&self, stream_id: &str) -> Option<StreamStats> {
        let (_, stream) = self.streams.remove(stream_id)?;
        stream.close_signal.notify_waiters();
        Some(stream.stats())
    }
}
