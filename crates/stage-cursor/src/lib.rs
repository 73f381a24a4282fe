//! Atomic, crash-safe per-stream checkpoint store (spec §4.1).
//!
//! A stage owns exactly one [`CursorStore`] per active input stream. Writers
//! are serialized through an `RwLock`; readers always observe a complete,
//! never-torn snapshot because [`CursorStore::save`] writes to a temp file,
//! `fsync`s it, and renames it into place atomically.

mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stage_core::Cursor;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use error::CursorError;

/// Delta applied to a cursor's running counters on [`CursorStore::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDelta {
    pub ledgers: u64,
    pub events: u64,
}

pub struct CursorStore {
    path: PathBuf,
    stream_id: String,
    state: Arc<RwLock<Cursor>>,
    save_attempts: u32,
}

impl CursorStore {
    /// Opens the checkpoint file at `path` for `stream_id`. A missing or
    /// corrupt file is treated as `NotFound` (spec §4.1 failure semantics):
    /// logged, and the store starts from a fresh cursor.
    pub async fn open(path: PathBuf, stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        let state = match Self::load_from_disk(&path).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => {
                info!(stream_id = %stream_id, "no checkpoint found, starting fresh");
                Cursor::new(stream_id.clone())
            }
            Err(err) => {
                warn!(stream_id = %stream_id, err = %err, "checkpoint file corrupt, treating as not found");
                Cursor::new(stream_id.clone())
            }
        };

        Self {
            path,
            stream_id,
            state: Arc::new(RwLock::new(state)),
            save_attempts: 5,
        }
    }

    async fn load_from_disk(path: &PathBuf) -> Result<Option<Cursor>, CursorError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let cursor: Cursor =
                    serde_json::from_slice(&bytes).map_err(|e| CursorError::Corrupt(e.to_string()))?;
                Ok(Some(cursor))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CursorError::Io(e.to_string())),
        }
    }

    /// Returns a consistent, point-in-time snapshot of the cursor.
    pub async fn load(&self) -> Cursor {
        self.state.read().await.clone()
    }

    /// Mutates the in-memory cursor; does not persist (spec §4.1). The
    /// cursor value never moves backward.
    pub async fn update(&self, sequence: u32, intra_ledger_index: u32, delta: CounterDelta) {
        let mut guard = self.state.write().await;
        if sequence < guard.last_processed_sequence {
            warn!(
                stream_id = %self.stream_id,
                current = guard.last_processed_sequence,
                attempted = sequence,
                "refusing to move cursor backward"
            );
            return;
        }
        guard.last_processed_sequence = sequence;
        guard.last_processed_intra_ledger_index = intra_ledger_index;
        guard.total_ledgers += delta.ledgers;
        guard.total_events += delta.events;
        guard.last_update_time = chrono::Utc::now();
    }

    /// Persists the full cursor snapshot atomically: write to a temp file,
    /// `fsync`, atomic rename (spec §4.1). Retried with adaptive backoff up
    /// to a bounded number of attempts; persistent failure is non-fatal but
    /// counted by the caller.
    pub async fn save(&self) -> Result<(), CursorError> {
        let snapshot = self.state.read().await.clone();
        let bytes = serde_json::to_vec_pretty(&snapshot).expect("Cursor serializes infallibly");

        let mut last_err = None;
        for attempt in 0..self.save_attempts {
            match Self::write_atomic(&self.path, &bytes).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(stream_id = %self.stream_id, attempt, err = %err, "checkpoint save failed, retrying");
                    last_err = Some(err);
                    let backoff = stage_core::governance::retry::compute_backoff(
                        attempt,
                        Duration::from_millis(0),
                        Duration::from_millis(100),
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(last_err.unwrap_or(CursorError::Io("unknown I/O failure".to_string())))
    }

    async fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<(), CursorError> {
        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| CursorError::Io(e.to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CursorError::Io(e.to_string()))?;
        file.sync_all().await.map_err(|e| CursorError::Io(e.to_string()))?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| CursorError::Io(e.to_string()))?;
        Ok(())
    }

    /// Returns the effective start sequence for a processing session (spec
    /// §4.1 `Resume`): resumes past the last committed checkpoint when it is
    /// ahead of the configured start.
    pub async fn resume(&self, cfg_start: u32) -> u32 {
        let cursor = self.load().await;
        if cursor.last_processed_sequence >= cfg_start && cursor.last_processed_sequence > 0 {
            cursor.last_processed_sequence + 1
        } else {
            cfg_start
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_uses_configured_start_when_no_checkpoint_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let store = CursorStore::open(path, "stream-a").await;
        assert_eq!(store.resume(1000).await, 1000);
    }

    #[tokio::test]
    async fn resume_continues_past_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let store = CursorStore::open(path, "stream-a").await;
        store.update(1004, 0, CounterDelta::default()).await;
        assert_eq!(store.resume(1000).await, 1005);
    }

    #[tokio::test]
    async fn save_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let store = CursorStore::open(path.clone(), "stream-a").await;
        store
            .update(
                1010,
                2,
                CounterDelta {
                    ledgers: 10,
                    events: 42,
                },
            )
            .await;
        store.save().await.unwrap();

        let reopened = CursorStore::open(path, "stream-a").await;
        let cursor = reopened.load().await;
        assert_eq!(cursor.last_processed_sequence, 1010);
        assert_eq!(cursor.total_events, 42);
    }

    #[tokio::test]
    async fn cursor_never_moves_backward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let store = CursorStore::open(path, "stream-a").await;
        store.update(1010, 0, CounterDelta::default()).await;
        store.update(1005, 0, CounterDelta::default()).await;
        let cursor = store.load().await;
        assert_eq!(cursor.last_processed_sequence, 1010);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_file_is_treated_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = CursorStore::open(path, "stream-a").await;
        assert_eq!(store.resume(1000).await, 1000);
    }

    #[tokio::test]
    async fn no_torn_writes_are_observable_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let store = CursorStore::open(path.clone(), "stream-a").await;
        for seq in 1..=50u32 {
            store.update(seq, 0, CounterDelta::default()).await;
            store.save().await.unwrap();
        }
        let bytes = tokio::fs::read(&path).await.unwrap();
        let cursor: Cursor = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(cursor.last_processed_sequence, 50);
    }
}
