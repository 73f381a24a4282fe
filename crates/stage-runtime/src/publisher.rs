//! Downstream publish boundary (spec §4.3 step 3e: "publish downstream via
//! FlightTransport or a row-by-row gRPC stream").
//!
//! `stage-runtime` publishes through this trait rather than depending
//! directly on a transport crate, so the same processing loop serves
//! whichever transport a deployment wires in.

use stage_core::{CoreError, DomainEvent};
use stage_fanout::BoundedFanout;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait DomainEventPublisher: Send + Sync {
    /// Publishes one processed batch downstream. A persistent failure (a
    /// sink that has exhausted its own retries, for instance) must be
    /// surfaced here so the caller can halt the session (spec §4.6, §7)
    /// rather than silently dropping durable rows.
    async fn publish(&self, batch: Vec<DomainEvent>) -> Result<(), CoreError>;
}

/// Publishes into an in-process [`BoundedFanout`], the default wiring when
/// a stage's downstream consumers attach directly (spec §4.2).
pub struct FanoutPublisher {
    fanout: Arc<BoundedFanout<DomainEvent>>,
}

impl FanoutPublisher {
    pub fn new(fanout: Arc<BoundedFanout<DomainEvent>>) -> Self {
        Self { fanout }
    }
}

#[async_trait::async_trait]
impl DomainEventPublisher for FanoutPublisher {
    async fn publish(&self, batch: Vec<DomainEvent>) -> Result<(), CoreError> {
        for event in batch {
            self.fanout.publish(event);
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub batches: Mutex<Vec<Vec<DomainEvent>>>,
    }

    #[async_trait::async_trait]
    impl DomainEventPublisher for RecordingPublisher {
        async fn publish(&self, batch: Vec<DomainEvent>) -> Result<(), CoreError> {
            self.batches.lock().await.push(batch);
            Ok(())
        }
    }
}
