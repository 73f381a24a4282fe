//! End-to-end orchestration for one processing session (spec §4.3):
//! upstream subscription, XDR decode worker pool, filter application,
//! downstream publish, and cursor maintenance.

pub mod decode;
pub mod publisher;
pub mod runtime;
pub mod session;
pub mod upstream;

pub use decode::{DecodeWorkerPool, LedgerDecoder, PassthroughDecoder, ReorderBuffer};
pub use publisher::{DomainEventPublisher, FanoutPublisher};
pub use runtime::StageRuntime;
pub use session::{SessionHandle, SessionRate, SessionStatus};
pub use upstream::{UpstreamSignal, UpstreamSource};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use stage_core::observability::MetricsRegistry;
    use stage_core::{Filter, RawLedger, SessionState};
    use stage_cursor::CursorStore;

    use crate::decode::PassthroughDecoder;
    use crate::publisher::test_support::RecordingPublisher;
    use crate::upstream::test_support::{ReconnectingScriptedUpstream, ScriptedUpstream};
    use crate::upstream::UpstreamSignal;
    use crate::StageRuntime;

    async fn new_runtime(
        script: Vec<crate::upstream::UpstreamItem>,
        publisher: Arc<RecordingPublisher>,
    ) -> StageRuntime {
        let dir = tempfile::tempdir().unwrap();
        let cursor_store = Arc::new(CursorStore::open(dir.path().join("cursor.json"), "test-stream").await);
        std::mem::forget(dir); // keep temp dir alive for the session's lifetime

        StageRuntime::new(
            Arc::new(ScriptedUpstream::new(script)),
            Arc::new(PassthroughDecoder),
            cursor_store,
            publisher,
            MetricsRegistry::new("test_runtime"),
            2,
            Duration::from_millis(50),
        )
    }

    fn ledger(sequence: u32) -> crate::upstream::UpstreamItem {
        Ok(UpstreamSignal::Ledger(RawLedger::new(
            sequence,
            "Test SDF Network ; September 2015",
            vec![0u8; 4],
        )))
    }

    #[tokio::test]
    async fn start_processing_rejects_zero_start() {
        let runtime = new_runtime(vec![], Arc::new(RecordingPublisher::default())).await;
        let result = runtime.start_processing(0, 0, 10, Filter::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_processing_rejects_end_before_start() {
        let runtime = new_runtime(vec![], Arc::new(RecordingPublisher::default())).await;
        let result = runtime.start_processing(100, 50, 10, Filter::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn processes_bounded_range_and_stops() {
        let publisher = Arc::new(RecordingPublisher::default());
        let script = vec![ledger(100), ledger(101), ledger(102)];
        let runtime = new_runtime(script, publisher.clone()).await;

        let session_id = runtime
            .start_processing(100, 102, 10, Filter::default())
            .await
            .unwrap();

        let mut status = runtime.get_status(&session_id).await.unwrap();
        for _ in 0..50 {
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runtime.get_status(&session_id).await.unwrap();
        }

        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.current_sequence, 102);
        assert_eq!(status.ledgers_processed, 3);
        assert_eq!(status.events_processed, 3);

        let batches = publisher.batches.lock().await;
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn sequence_gap_is_fatal() {
        let publisher = Arc::new(RecordingPublisher::default());
        let script = vec![ledger(100), ledger(105)];
        let runtime = new_runtime(script, publisher).await;

        let session_id = runtime
            .start_processing(100, 0, 10, Filter::default())
            .await
            .unwrap();

        let mut status = runtime.get_status(&session_id).await.unwrap();
        for _ in 0..50 {
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runtime.get_status(&session_id).await.unwrap();
        }

        assert_eq!(status.state, SessionState::Error);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn retryable_upstream_error_reopens_the_stream() {
        let publisher = Arc::new(RecordingPublisher::default());
        let upstream = Arc::new(ReconnectingScriptedUpstream::new(vec![
            vec![
                ledger(100),
                Err(stage_core::CoreError::Transport(Box::new(std::io::Error::other("flaky")))),
            ],
            vec![ledger(101), ledger(102)],
        ]));

        let dir = tempfile::tempdir().unwrap();
        let cursor_store = Arc::new(CursorStore::open(dir.path().join("cursor.json"), "test-stream").await);
        std::mem::forget(dir);

        let runtime = StageRuntime::new(
            upstream.clone(),
            Arc::new(PassthroughDecoder),
            cursor_store,
            publisher.clone(),
            MetricsRegistry::new("test_runtime_reconnect"),
            2,
            Duration::from_millis(50),
        );

        let session_id = runtime
            .start_processing(100, 102, 10, Filter::default())
            .await
            .unwrap();

        let mut status = runtime.get_status(&session_id).await.unwrap();
        for _ in 0..300 {
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runtime.get_status(&session_id).await.unwrap();
        }

        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.current_sequence, 102);
        assert_eq!(
            upstream.opens_seen.load(std::sync::atomic::Ordering::SeqCst),
            2,
            "a retryable error must reopen the upstream exactly once before resuming"
        );
    }

    #[tokio::test]
    async fn stop_processing_transitions_to_stopping_or_terminal() {
        let publisher = Arc::new(RecordingPublisher::default());
        // An upstream that never ends, so the session is still running when
        // we call StopProcessing.
        let script = vec![ledger(100)];
        let runtime = new_runtime(script, publisher).await;
        let session_id = runtime
            .start_processing(100, 0, 10, Filter::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        runtime.stop_processing(&session_id).await.unwrap();

        let status = runtime.get_status(&session_id).await.unwrap();
        assert!(matches!(
            status.state,
            SessionState::Stopping | SessionState::Stopped
        ));
    }

    #[tokio::test]
    async fn tip_wait_resumes_once_the_next_ledger_arrives() {
        let publisher = Arc::new(RecordingPublisher::default());
        let script = vec![
            Ok(UpstreamSignal::CursorBoundary { latest: 5000 }),
            ledger(5001),
        ];
        let runtime = new_runtime(script, publisher.clone()).await;
        let session_id = runtime
            .start_processing(5000, 5001, 10, Filter::default())
            .await
            .unwrap();

        let mut status = runtime.get_status(&session_id).await.unwrap();
        for _ in 0..100 {
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = runtime.get_status(&session_id).await.unwrap();
        }

        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.current_sequence, 5001);
        assert_eq!(status.events_processed, 1);
    }

    #[tokio::test]
    async fn resumes_past_an_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join("cursor.json");
        let cursor_store = Arc::new(CursorStore::open(cursor_path.clone(), "test-stream").await);
        cursor_store
            .update(1004, 0, stage_cursor::CounterDelta::default())
            .await;
        cursor_store.save().await.unwrap();

        let script = vec![ledger(1005), ledger(1006)];
        let runtime = StageRuntime::new(
            Arc::new(ScriptedUpstream::new(script)),
            Arc::new(PassthroughDecoder),
            cursor_store,
            Arc::new(RecordingPublisher::default()),
            MetricsRegistry::new("test_runtime_resume"),
            2,
            Duration::from_millis(50),
        );

        let session_id = runtime
            .start_processing(1000, 1006, 10, Filter::default())
            .await
            .unwrap();

        let mut status = runtime.get_status(&session_id).await.unwrap();
        for _ in 0..50 {
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runtime.get_status(&session_id).await.unwrap();
        }

        assert_eq!(status.state, SessionState::Stopped);
        // The effective start skipped past the checkpoint; the first
        // observed sequence is 1005, not the configured 1000.
        assert_eq!(status.current_sequence, 1006);
        assert_eq!(status.ledgers_processed, 2);
    }

    #[tokio::test]
    async fn configure_filters_takes_effect_on_next_ledger() {
        let publisher = Arc::new(RecordingPublisher::default());
        let script = vec![ledger(100), ledger(101)];
        let runtime = new_runtime(script, publisher.clone()).await;
        let session_id = runtime
            .start_processing(100, 101, 10, Filter::default())
            .await
            .unwrap();

        let excludes_everything = Filter {
            event_types: vec!["nonexistent.event.type".to_string()],
            ..Default::default()
        };
        runtime
            .configure_filters(&session_id, excludes_everything)
            .unwrap();

        let mut status = runtime.get_status(&session_id).await.unwrap();
        for _ in 0..50 {
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runtime.get_status(&session_id).await.unwrap();
        }

        // At least the filter reconfiguration must not have errored the
        // session, regardless of which ledger it applied to first.
        assert_eq!(status.state, SessionState::Stopped);
    }
}
