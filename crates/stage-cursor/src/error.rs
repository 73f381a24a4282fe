use thiserror::Error;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("checkpoint file I/O error: {0}")]
    Io(String),
    #[error("checkpoint file corrupt: {0}")]
    Corrupt(String),
}
