//! Session bookkeeping: the state machine and status snapshot exposed by
//! `GetStatus`/`GetMetrics` (spec §4.3).

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use stage_core::{Filter, SessionState};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Point-in-time snapshot returned by `GetStatus`.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub current_sequence: u32,
    pub target_sequence: u32,
    pub events_processed: u64,
    pub events_skipped: u64,
    pub ledgers_processed: u64,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn starting(target_sequence: u32) -> Self {
        Self {
            state: SessionState::Starting,
            current_sequence: 0,
            target_sequence,
            events_processed: 0,
            events_skipped: 0,
            ledgers_processed: 0,
            last_error: None,
        }
    }
}

/// Derived rate returned by `GetMetrics`, alongside the raw counters.
#[derive(Debug, Clone, Copy)]
pub struct SessionRate {
    pub events_per_second: f64,
    pub ledgers_per_second: f64,
}

/// Everything the runtime keeps about one in-flight or finished session.
/// Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub status: Arc<RwLock<SessionStatus>>,
    pub filter: Arc<ArcSwap<Filter>>,
    pub cancellation: CancellationToken,
    started_at: Instant,
}

impl SessionHandle {
    pub fn new(session_id: impl Into<String>, target_sequence: u32, filter: Filter) -> Self {
        Self {
            session_id: session_id.into(),
            status: Arc::new(RwLock::new(SessionStatus::starting(target_sequence))),
            filter: Arc::new(ArcSwap::from_pointee(filter)),
            cancellation: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub async fn snapshot(&self) -> SessionStatus {
        self.status.read().await.clone()
    }

    pub fn rate(&self, status: &SessionStatus) -> SessionRate {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(0.001);
        SessionRate {
            events_per_second: status.events_processed as f64 / elapsed,
            ledgers_per_second: status.ledgers_processed as f64 / elapsed,
        }
    }
}
