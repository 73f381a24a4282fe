//! Observability facade: stable structured logging keys (spec §7) and the
//! process-wide metrics registry (spec §9 "Global mutable state": treated
//! as an explicit singleton initialized at stage startup).

pub mod keys;
pub mod metrics;

pub use metrics::MetricsRegistry;
