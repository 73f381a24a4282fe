//! `StageRuntime`: end-to-end orchestration for one processing session
//! (spec §4.3). Owns upstream subscription, the decode worker pool, filter
//! application, downstream publish, and cursor maintenance.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use stage_core::error::ErrorCategory;
use stage_core::governance::retry::compute_backoff;
use stage_core::governance::CircuitBreaker;
use stage_core::observability::MetricsRegistry;
use stage_core::{CoreError, Filter, SessionState};
use stage_cursor::{CounterDelta, CursorStore};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::decode::{DecodeWorkerPool, LedgerDecoder, ReorderBuffer};
use crate::publisher::DomainEventPublisher;
use crate::session::{SessionHandle, SessionRate, SessionStatus};
use crate::upstream::{UpstreamSignal, UpstreamSource};

const TIP_WAIT: Duration = Duration::from_secs(5);
const CIRCUIT_TRIP_THRESHOLD: u32 = 5;
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);

pub struct StageRuntime {
    upstream: Arc<dyn UpstreamSource>,
    decoder: Arc<dyn LedgerDecoder>,
    cursor_store: Arc<CursorStore>,
    publisher: Arc<dyn DomainEventPublisher>,
    metrics: MetricsRegistry,
    worker_count: usize,
    batch_size_default: usize,
    commit_interval: Duration,
    sessions: DashMap<String, SessionHandle>,
}

impl StageRuntime {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        decoder: Arc<dyn LedgerDecoder>,
        cursor_store: Arc<CursorStore>,
        publisher: Arc<dyn DomainEventPublisher>,
        metrics: MetricsRegistry,
        worker_count: usize,
        commit_interval: Duration,
    ) -> Self {
        Self {
            upstream,
            decoder,
            cursor_store,
            publisher,
            metrics,
            worker_count,
            batch_size_default: 1000,
            commit_interval,
            sessions: DashMap::new(),
        }
    }

    /// Validates and launches a processing session, returning its id
    /// immediately; the processing loop runs on a background task (spec
    /// §4.3 `StartProcessing`).
    pub async fn start_processing(
        &self,
        start: u32,
        end: u32,
        batch_size: usize,
        filters: Filter,
    ) -> Result<String, CoreError> {
        if start == 0 {
            return Err(CoreError::InvalidArgument("start must be > 0".to_string()));
        }
        if end != 0 && end < start {
            return Err(CoreError::InvalidArgument(
                "end must be 0 or >= start".to_string(),
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let batch_size = if batch_size == 0 {
            self.batch_size_default
        } else {
            batch_size
        };
        let handle = SessionHandle::new(session_id.clone(), end, filters);
        self.sessions.insert(session_id.clone(), handle.clone());
        self.metrics.active_sessions().inc();

        let upstream = self.upstream.clone();
        let decoder = self.decoder.clone();
        let cursor_store = self.cursor_store.clone();
        let publisher = self.publisher.clone();
        let metrics = self.metrics.clone();
        let worker_count = self.worker_count;
        let commit_interval = self.commit_interval;
        let loop_handle = handle.clone();

        tokio::spawn(async move {
            run_processing_loop(
                loop_handle,
                start,
                end,
                batch_size,
                upstream,
                decoder,
                cursor_store,
                publisher,
                metrics,
                worker_count,
                commit_interval,
            )
            .await;
        });

        Ok(session_id)
    }

    /// Signals cancellation and transitions the session to `STOPPING`;
    /// returns once the signal has been sent, not once the loop has
    /// actually exited (spec §4.3 `StopProcessing`).
    pub async fn stop_processing(&self, session_id: &str) -> Result<(), CoreError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session {session_id}")))?;
        {
            let mut status = handle.status.write().await;
            if !status.state.is_terminal() {
                status.state = SessionState::Stopping;
            }
        }
        handle.cancellation.cancel();
        Ok(())
    }

    pub async fn get_status(&self, session_id: &str) -> Result<SessionStatus, CoreError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session {session_id}")))?;
        Ok(handle.snapshot().await)
    }

    /// Atomically swaps the compiled filter snapshot; takes effect on the
    /// next processed ledger (spec §4.3 `ConfigureFilters`).
    pub fn configure_filters(&self, session_id: &str, filter: Filter) -> Result<(), CoreError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session {session_id}")))?;
        handle.filter.store(Arc::new(filter));
        Ok(())
    }

    pub async fn get_metrics(&self, session_id: &str) -> Result<(SessionStatus, SessionRate), CoreError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown session {session_id}")))?;
        let status = handle.snapshot().await;
        let rate = handle.rate(&status);
        Ok((status, rate))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_processing_loop(
    handle: SessionHandle,
    start: u32,
    end: u32,
    batch_size: usize,
    upstream: Arc<dyn UpstreamSource>,
    decoder: Arc<dyn LedgerDecoder>,
    cursor_store: Arc<CursorStore>,
    publisher: Arc<dyn DomainEventPublisher>,
    metrics: MetricsRegistry,
    worker_count: usize,
    commit_interval: Duration,
) {
    let resumed = cursor_store.resume(start).await;
    let effective_start = resumed.max(start);

    let mut stream = match upstream.open(effective_start).await {
        Ok(stream) => stream,
        Err(err) => {
            fail_session(&handle, &err).await;
            return;
        }
    };

    let mut pool = DecodeWorkerPool::spawn(worker_count, decoder);
    let mut reorder = ReorderBuffer::new(effective_start);
    let mut last_sequence: Option<u32> = if effective_start > start { Some(effective_start - 1) } else { None };
    let mut in_flight: usize = 0;
    let mut pending_batch = Vec::new();
    let circuit_breaker = Mutex::new(CircuitBreaker::new(CIRCUIT_TRIP_THRESHOLD, CIRCUIT_COOLDOWN));
    let mut commit_ticker = tokio::time::interval(commit_interval);
    commit_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'outer: loop {
        tokio::select! {
            biased;

            _ = handle.cancellation.cancelled() => {
                info!(session_id = %handle.session_id, "processing session cancelled, flushing pending work");
                break 'outer;
            }

            _ = commit_ticker.tick() => {
                if let Err(err) = cursor_store.save().await {
                    warn!(session_id = %handle.session_id, err = %err, "coalesced cursor save failed");
                }
            }

            item = stream.next() => {
                let Some(item) = item else {
                    info!(session_id = %handle.session_id, "upstream stream ended");
                    break 'outer;
                };

                match item {
                    Ok(UpstreamSignal::CursorBoundary { latest }) => {
                        info!(session_id = %handle.session_id, latest, "at upstream tip, waiting");
                        last_sequence = Some(latest);
                        tokio::time::sleep(TIP_WAIT).await;
                    }
                    Ok(UpstreamSignal::Ledger(raw)) => {
                        if end != 0 && raw.sequence > end {
                            info!(session_id = %handle.session_id, end, "reached configured end sequence");
                            break 'outer;
                        }
                        if let Some(last) = last_sequence {
                            if raw.sequence != last + 1 {
                                let err = CoreError::SequenceGap { expected: last + 1, actual: raw.sequence };
                                error!(session_id = %handle.session_id, err = %err, "sequence gap detected, terminating session");
                                fail_session(&handle, &err).await;
                                break 'outer;
                            }
                        }
                        last_sequence = Some(raw.sequence);
                        circuit_breaker.lock().await.record_success();

                        {
                            let mut status = handle.status.write().await;
                            if status.state == SessionState::Starting {
                                status.state = SessionState::Running;
                            }
                        }

                        let sequence = raw.sequence;
                        metrics.bytes_processed().inc_by(raw.ledger_close_meta_xdr.len() as u64);
                        pool.submit(sequence, raw).await;
                        in_flight += 1;

                        while let Some((seq, result)) = pool.try_recv() {
                            reorder.insert(seq, result);
                            in_flight -= 1;
                        }
                        for (seq, result) in reorder.drain_ready() {
                            if !apply_decoded(&handle, &cursor_store, &metrics, seq, result, &mut pending_batch).await {
                                break 'outer;
                            }
                            if pending_batch.len() >= batch_size
                                && !flush_batch(&handle, &publisher, &metrics, &mut pending_batch).await
                            {
                                break 'outer;
                            }
                        }
                    }
                    Err(err) => {
                        match err.category() {
                            ErrorCategory::CursorBoundary => {
                                tokio::time::sleep(TIP_WAIT).await;
                            }
                            ErrorCategory::Retryable(advice) => {
                                circuit_breaker.lock().await.record_failure();
                                let resume_from = last_sequence.map(|s| s + 1).unwrap_or(effective_start);
                                match reconnect_upstream(&handle, upstream.as_ref(), &circuit_breaker, resume_from, advice).await {
                                    Some(new_stream) => stream = new_stream,
                                    None => {
                                        let err = CoreError::Transport(Box::new(std::io::Error::other(
                                            "upstream reconnect attempts exhausted",
                                        )));
                                        error!(session_id = %handle.session_id, err = %err, "giving up on upstream after repeated retryable failures");
                                        fail_session(&handle, &err).await;
                                        break 'outer;
                                    }
                                }
                            }
                            _ => {
                                error!(session_id = %handle.session_id, err = %err, "fatal upstream error");
                                fail_session(&handle, &err).await;
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }
    }

    {
        let mut status = handle.status.write().await;
        if !status.state.is_terminal() {
            status.state = SessionState::Stopping;
        }
    }

    // Drain any decodes still in flight before flushing (best-effort).
    while in_flight > 0 {
        match pool.recv().await {
            Some((seq, result)) => {
                in_flight -= 1;
                reorder.insert(seq, result);
            }
            None => break,
        }
    }
    for (seq, result) in reorder.drain_ready() {
        apply_decoded(&handle, &cursor_store, &metrics, seq, result, &mut pending_batch).await;
    }
    if !pending_batch.is_empty() {
        // Return value ignored: a failure here already calls `fail_session`
        // internally, and the loop has already exited, so there is nothing
        // left to break out of.
        flush_batch(&handle, &publisher, &metrics, &mut pending_batch).await;
    }

    if let Err(err) = cursor_store.save().await {
        warn!(session_id = %handle.session_id, err = %err, "final cursor save failed");
    }

    let mut status = handle.status.write().await;
    if status.state != SessionState::Error {
        status.state = SessionState::Stopped;
    }
    metrics.active_sessions().dec();
}

/// Reopens the upstream after a retryable error, gated by the circuit
/// breaker's `allow_call` (spec §4.3: "open state blocks upstream calls for
/// a cooldown interval, then half-opens for a trial call"). Backs off
/// between attempts and gives up after `advice.max_attempts`, returning
/// `None` so the caller can fail the session rather than spin forever.
async fn reconnect_upstream(
    handle: &SessionHandle,
    upstream: &dyn UpstreamSource,
    circuit_breaker: &Mutex<CircuitBreaker>,
    resume_from: u32,
    advice: stage_core::error::RetryAdvice,
) -> Option<futures::stream::BoxStream<'static, crate::upstream::UpstreamItem>> {
    for attempt in 0..advice.max_attempts {
        let backoff = compute_backoff(attempt, Duration::from_millis(0), advice.base);
        tokio::time::sleep(backoff).await;

        if !circuit_breaker.lock().await.allow_call() {
            warn!(session_id = %handle.session_id, attempt, "circuit breaker open, deferring reconnect");
            continue;
        }

        match upstream.open(resume_from).await {
            Ok(new_stream) => {
                circuit_breaker.lock().await.record_success();
                return Some(new_stream);
            }
            Err(err) => {
                warn!(session_id = %handle.session_id, attempt, err = %err, "upstream reconnect attempt failed");
                circuit_breaker.lock().await.record_failure();
            }
        }
    }
    None
}

async fn fail_session(handle: &SessionHandle, err: &CoreError) {
    let mut status = handle.status.write().await;
    status.state = SessionState::Error;
    status.last_error = Some(err.to_string());
}

/// Applies the session's current filter to decoded events, updates the
/// cursor in memory, and appends survivors to the pending batch. Returns
/// `false` if the session must terminate (a non-retryable decode error).
async fn apply_decoded(
    handle: &SessionHandle,
    cursor_store: &Arc<CursorStore>,
    metrics: &MetricsRegistry,
    sequence: u32,
    result: Result<Vec<stage_core::DomainEvent>, CoreError>,
    pending_batch: &mut Vec<stage_core::DomainEvent>,
) -> bool {
    let events = match result {
        Ok(events) => events,
        Err(err) => {
            error!(session_id = %handle.session_id, sequence, err = %err, "decode failed, terminating session");
            fail_session(handle, &err).await;
            return false;
        }
    };

    let filter = handle.filter.load();
    let mut processed = 0u64;
    let mut skipped = 0u64;
    let mut last_intra_ledger_index = 0u32;
    for event in events {
        last_intra_ledger_index = event.intra_ledger_index;
        if filter.matches(&event) {
            pending_batch.push(event);
            processed += 1;
        } else {
            skipped += 1;
        }
    }
    metrics.events_processed().inc_by(processed);
    metrics.events_skipped().inc_by(skipped);
    metrics.last_processed_ledger().set(sequence as i64);

    cursor_store
        .update(
            sequence,
            last_intra_ledger_index,
            stage_cursor::CounterDelta {
                ledgers: 1,
                events: processed,
            },
        )
        .await;

    let mut status = handle.status.write().await;
    status.current_sequence = sequence;
    status.events_processed += processed;
    status.events_skipped += skipped;
    status.ledgers_processed += 1;
    drop(status);

    true
}

/// Publishes the pending batch downstream. Returns `false` if the session
/// must terminate because publishing failed persistently (spec §4.6: a
/// sink that has exhausted its own retries halts the session rather than
/// dropping rows silently).
async fn flush_batch(
    handle: &SessionHandle,
    publisher: &Arc<dyn DomainEventPublisher>,
    metrics: &MetricsRegistry,
    pending_batch: &mut Vec<stage_core::DomainEvent>,
) -> bool {
    let batch = std::mem::take(pending_batch);
    let size = batch.len();
    let started = std::time::Instant::now();
    let result = publisher.publish(batch).await;
    metrics.processing_latency_seconds().observe(started.elapsed().as_secs_f64());
    if let Err(err) = result {
        error!(session_id = %handle.session_id, err = %err, "publish failed, terminating session");
        fail_session(handle, &err).await;
        return false;
    }
    metrics.batches_created().inc();
    info!(session_id = %handle.session_id, batch_size = size, "published batch downstream");
    true
}
