//! XDR-to-domain decode worker pool with sequence-ordered output (spec
//! §4.3 "Worker pool").
//!
//! `N` workers pull `(sequence, RawLedger)` pairs from a shared input
//! channel and push `(sequence, Result<Vec<DomainEvent>, CoreError>)` onto a
//! shared output channel. Workers complete out of order; [`ReorderBuffer`]
//! restores sequence order before the runtime applies filters and batches.

use std::collections::BTreeMap;
use std::sync::Arc;

use stage_core::{CoreError, DomainEvent, RawLedger};
use tokio::sync::{mpsc, Mutex};

/// Decodes one raw ledger's XDR payload into zero or more domain events.
/// Implementations must be pure with respect to ordering: decoding ledger
/// `N` must not depend on having already decoded ledger `N-1`.
pub trait LedgerDecoder: Send + Sync + 'static {
    fn decode(&self, ledger: &RawLedger) -> Result<Vec<DomainEvent>, CoreError>;
}

/// Decoder that performs no semantic XDR parsing: each raw ledger becomes a
/// single domain event carrying the ledger's close-meta bytes verbatim.
/// Used by stages that forward raw ledger data without interpreting it.
pub struct PassthroughDecoder;

impl LedgerDecoder for PassthroughDecoder {
    fn decode(&self, ledger: &RawLedger) -> Result<Vec<DomainEvent>, CoreError> {
        let event = DomainEvent::builder("stellar.ledger.raw.v1", ledger.sequence, 0, "passthrough")
            .payload(ledger.ledger_close_meta_xdr.clone())
            .content_type("application/octet-stream")
            .build();
        Ok(vec![event])
    }
}

pub type DecodeOutput = (u32, Result<Vec<DomainEvent>, CoreError>);

pub struct DecodeWorkerPool {
    input_tx: mpsc::Sender<(u32, RawLedger)>,
    output_rx: mpsc::Receiver<DecodeOutput>,
}

impl DecodeWorkerPool {
    /// Spawns `worker_count` tokio tasks sharing one input queue. Input
    /// capacity bounds the number of ledgers that can be in flight at once,
    /// providing natural backpressure against a slow downstream.
    pub fn spawn(worker_count: usize, decoder: Arc<dyn LedgerDecoder>) -> Self {
        let worker_count = worker_count.max(1);
        let (input_tx, input_rx) = mpsc::channel(worker_count * 4);
        let (output_tx, output_rx) = mpsc::channel(worker_count * 4);
        let input_rx = Arc::new(Mutex::new(input_rx));

        for _ in 0..worker_count {
            let input_rx = input_rx.clone();
            let output_tx = output_tx.clone();
            let decoder = decoder.clone();
            tokio::spawn(async move {
                loop {
                    let next = { input_rx.lock().await.recv().await };
                    let Some((sequence, ledger)) = next else {
                        break;
                    };
                    let result = decoder.decode(&ledger);
                    if output_tx.send((sequence, result)).await.is_err() {
                        break;
                    }
                }
            });
        }

        Self { input_tx, output_rx }
    }

    /// Submits a ledger for decoding, waiting for input capacity if the
    /// worker pool is saturated.
    pub async fn submit(&self, sequence: u32, ledger: RawLedger) {
        // A closed receiver means the pool has shut down; dropping the
        // ledger is the correct response since no one will consume it.
        let _ = self.input_tx.send((sequence, ledger)).await;
    }

    /// Returns the next completed decode without blocking, if one is ready.
    pub fn try_recv(&mut self) -> Option<DecodeOutput> {
        self.output_rx.try_recv().ok()
    }

    /// Awaits the next completed decode.
    pub async fn recv(&mut self) -> Option<DecodeOutput> {
        self.output_rx.recv().await
    }
}

/// Restores sequence order over a stream of out-of-order decode
/// completions (spec §4.3 "preserving sequence order via a reorder
/// buffer").
pub struct ReorderBuffer<T> {
    next_sequence: u32,
    pending: BTreeMap<u32, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(start_sequence: u32) -> Self {
        Self {
            next_sequence: start_sequence,
            pending: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, sequence: u32, item: T) {
        self.pending.insert(sequence, item);
    }

    /// Pops and returns every contiguous item starting at `next_sequence`,
    /// in order. Items still waiting on a gap stay buffered.
    pub fn drain_ready(&mut self) -> Vec<(u32, T)> {
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_sequence) {
            ready.push((self.next_sequence, item));
            self.next_sequence += 1;
        }
        ready
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
