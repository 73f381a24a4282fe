//! Abstraction over the upstream raw-ledger source (spec §4.3 step 2,
//! "open upstream stream from effective_start").
//!
//! `stage-runtime` does not know or care whether the upstream is a gRPC
//! subscription, a polling HTTP archive, or (in tests) a canned sequence.
//! It only needs an ordered stream of [`UpstreamSignal`]s.

use futures::stream::BoxStream;
use stage_core::{CoreError, RawLedger};

/// One item produced by an upstream subscription.
#[derive(Debug, Clone)]
pub enum UpstreamSignal {
    Ledger(RawLedger),
    /// The requested sequence is beyond the upstream's current tip. Carries
    /// the tip the upstream actually observed (spec §4.3 step 4,
    /// cursor-boundary classification).
    CursorBoundary { latest: u32 },
}

pub type UpstreamItem = Result<UpstreamSignal, CoreError>;

#[async_trait::async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Opens a stream of ledgers starting at `effective_start` (inclusive).
    async fn open(&self, effective_start: u32) -> Result<BoxStream<'static, UpstreamItem>, CoreError>;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use futures::stream;
    use std::sync::Mutex;

    /// Replays a fixed, pre-scripted sequence of items regardless of the
    /// requested start sequence. Useful for exercising runtime behavior
    /// deterministically.
    pub struct ScriptedUpstream {
        script: Mutex<Option<Vec<UpstreamItem>>>,
    }

    impl ScriptedUpstream {
        pub fn new(script: Vec<UpstreamItem>) -> Self {
            Self {
                script: Mutex::new(Some(script)),
            }
        }
    }

    #[async_trait::async_trait]
    impl UpstreamSource for ScriptedUpstream {
        async fn open(&self, _effective_start: u32) -> Result<BoxStream<'static, UpstreamItem>, CoreError> {
            let script = self
                .script
                .lock()
                .unwrap()
                .take()
                .expect("ScriptedUpstream can only be opened once per test");
            Ok(Box::pin(stream::iter(script)))
        }
    }

    /// Like `ScriptedUpstream`, but hands out one script per `open()` call
    /// in order, so a test can exercise reconnect-after-retryable-error
    /// behavior: the first script ends in a retryable error, the second
    /// script (returned by the reconnect's `open()` call) picks up from
    /// where the first left off.
    pub struct ReconnectingScriptedUpstream {
        scripts: Mutex<std::collections::VecDeque<Vec<UpstreamItem>>>,
        pub opens_seen: std::sync::atomic::AtomicU32,
    }

    impl ReconnectingScriptedUpstream {
        pub fn new(scripts: Vec<Vec<UpstreamItem>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                opens_seen: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl UpstreamSource for ReconnectingScriptedUpstream {
        async fn open(&self, _effective_start: u32) -> Result<BoxStream<'static, UpstreamItem>, CoreError> {
            self.opens_seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("ReconnectingScriptedUpstream ran out of scripted opens");
            Ok(Box::pin(stream::iter(script)))
        }
    }
}
