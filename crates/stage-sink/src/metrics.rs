//! Lag metrics exposed by `SinkEngine` (spec §4.6).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default)]
pub struct SinkMetricsSnapshot {
    pub events_received: u64,
    pub events_written: u64,
    pub events_failed: u64,
    pub batches_flushed: u64,
    pub last_flush_latency_millis: u64,
    pub last_written_sequence: u32,
}

#[derive(Default)]
pub struct SinkMetrics {
    events_received: AtomicU64,
    events_written: AtomicU64,
    events_failed: AtomicU64,
    batches_flushed: AtomicU64,
    last_flush_latency_millis: AtomicU64,
    last_written_sequence: AtomicU32,
}

impl SinkMetrics {
    pub fn record_received(&self, count: u64) {
        self.events_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_flush_success(&self, written: u64, latency_millis: u64, last_sequence: u32) {
        self.events_written.fetch_add(written, Ordering::Relaxed);
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.last_flush_latency_millis.store(latency_millis, Ordering::Relaxed);
        self.last_written_sequence.store(last_sequence, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self, failed: u64) {
        self.events_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SinkMetricsSnapshot {
        SinkMetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            last_flush_latency_millis: self.last_flush_latency_millis.load(Ordering::Relaxed),
            last_written_sequence: self.last_written_sequence.load(Ordering::Relaxed),
        }
    }
}
