//! Process-wide Prometheus registry (spec §6 `GET /metrics`).
//!
//! One [`MetricsRegistry`] is created per stage process at startup and
//! shared (via `Arc`) by every long-running task listed in spec §5. It is
//! the single explicit singleton this workspace relies on.

use std::sync::Arc;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    pub events_processed: IntCounter,
    pub events_skipped: IntCounter,
    pub batches_created: IntCounter,
    pub bytes_processed: IntCounter,
    pub last_processed_ledger: IntGauge,
    pub active_sessions: IntGauge,
    pub heartbeats_sent: IntCounter,
    pub heartbeats_errored: IntCounter,
    pub flight_clients_connected: IntGauge,
    pub records_streamed: IntCounter,
    pub fanout_drops: IntCounter,
    pub processing_latency_seconds: Histogram,
}

impl MetricsRegistry {
    pub fn new(component: &str) -> Self {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let c = IntCounter::new(format!("{component}_{}", $name), $help).unwrap();
                registry.register(Box::new(c.clone())).unwrap();
                c
            }};
        }
        macro_rules! gauge {
            ($name:literal, $help:literal) => {{
                let g = IntGauge::new(format!("{component}_{}", $name), $help).unwrap();
                registry.register(Box::new(g.clone())).unwrap();
                g
            }};
        }
        macro_rules! histogram {
            ($name:literal, $help:literal, $buckets:expr) => {{
                let opts = HistogramOpts::new(format!("{component}_{}", $name), $help).buckets($buckets);
                let h = Histogram::with_opts(opts).unwrap();
                registry.register(Box::new(h.clone())).unwrap();
                h
            }};
        }

        let inner = Inner {
            events_processed: counter!("events_processed_total", "domain events emitted downstream"),
            events_skipped: counter!("events_skipped_total", "domain events dropped by a filter"),
            batches_created: counter!("batches_created_total", "downstream batches published"),
            bytes_processed: counter!("bytes_processed_total", "raw ledger bytes decoded"),
            last_processed_ledger: gauge!("last_processed_ledger", "highest ledger sequence committed"),
            active_sessions: gauge!("active_sessions", "processing sessions currently running"),
            heartbeats_sent: counter!("heartbeats_sent_total", "control-plane heartbeats sent"),
            heartbeats_errored: counter!("heartbeats_errored_total", "control-plane heartbeats that failed"),
            flight_clients_connected: gauge!("flight_clients_connected", "active Arrow Flight DoGet streams"),
            records_streamed: counter!("records_streamed_total", "Arrow record batches streamed"),
            fanout_drops: counter!("fanout_drops_total", "items dropped by BoundedFanout overflow"),
            processing_latency_seconds: histogram!(
                "processing_latency_seconds",
                "time from ledger decode through downstream publish",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            registry,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn events_processed(&self) -> &IntCounter {
        &self.inner.events_processed
    }
    pub fn events_skipped(&self) -> &IntCounter {
        &self.inner.events_skipped
    }
    pub fn batches_created(&self) -> &IntCounter {
        &self.inner.batches_created
    }
    pub fn bytes_processed(&self) -> &IntCounter {
        &self.inner.bytes_processed
    }
    pub fn last_processed_ledger(&self) -> &IntGauge {
        &self.inner.last_processed_ledger
    }
    pub fn active_sessions(&self) -> &IntGauge {
        &self.inner.active_sessions
    }
    pub fn heartbeats_sent(&self) -> &IntCounter {
        &self.inner.heartbeats_sent
    }
    pub fn heartbeats_errored(&self) -> &IntCounter {
        &self.inner.heartbeats_errored
    }
    pub fn flight_clients_connected(&self) -> &IntGauge {
        &self.inner.flight_clients_connected
    }
    pub fn records_streamed(&self) -> &IntCounter {
        &self.inner.records_streamed
    }
    pub fn fanout_drops(&self) -> &IntCounter {
        &self.inner.fanout_drops
    }
    pub fn processing_latency_seconds(&self) -> &Histogram {
        &self.inner.processing_latency_seconds
    }

    /// Flattens every registered metric to a `name -> value` map, for the
    /// control-plane heartbeat payload (spec §4.4: "Metric keys are flat,
    /// no nesting").
    pub fn snapshot_flat(&self) -> std::collections::BTreeMap<String, f64> {
        let mut flat = std::collections::BTreeMap::new();
        for family in self.inner.registry.gather() {
            for metric in family.get_metric() {
                let value = if metric.has_counter() {
                    metric.get_counter().get_value()
                } else if metric.has_gauge() {
                    metric.get_gauge().get_value()
                } else {
                    continue;
                };
                flat.insert(family.get_name().to_string(), value);
            }
        }
        flat
    }

    /// Renders the registry in Prometheus text exposition format, for the
    /// `GET /metrics` handler.
    pub fn render(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .expect("prometheus text encoding is infallible for well-formed metrics");
        String::from_utf8(buffer).expect("prometheus text encoder emits valid UTF-8")
    }
}
