//! Buffers typed rows derived from `DomainEvent`s, flushes them to a
//! backing store in bounded, upserted batches, and checkpoints progress
//! (spec §4.6).

pub mod engine;
pub mod metrics;
pub mod row;
pub mod sink;

pub use engine::SinkEngine;
pub use metrics::{SinkMetrics, SinkMetricsSnapshot};
pub use row::{DefaultRowMapper, RowMapper, SinkRow};
pub use sink::{ParquetSink, PostgresSink, Sink};
