//! Shared error taxonomy (spec §7).
//!
//! A single concrete `CoreError` rather than a layered Core/Domain/Impl
//! split, since every crate in this workspace targets `std` + tokio and
//! has no need for `no_std` generality. `ErrorCategory` is what drives
//! retry/circuit-breaker decisions downstream.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// The stable error domain shared by every stage crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config: {0}")]
    Config(String),

    #[error("transport: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("cursor boundary: upstream reports tip at {latest}")]
    CursorBoundary { latest: u32 },

    #[error("decode failed at sequence {sequence}: {reason}")]
    Decode { sequence: u32, reason: String },

    #[error("downstream send failed: {0}")]
    Downstream(String),

    #[error("persistence: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("control plane: {0}")]
    ControlPlane(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sequence gap detected: expected {expected}, got {actual}")]
    SequenceGap { expected: u32, actual: u32 },
}

impl CoreError {
    /// Maps an error to the category that drives retry/circuit-breaker
    /// behavior (spec §4.3, §7). `Filter` never produces an error (it is
    /// pure), so there is no corresponding variant here.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::Config(_) => ErrorCategory::NonRetryable,
            CoreError::Transport(_) => ErrorCategory::Retryable(RetryAdvice::default()),
            CoreError::CursorBoundary { .. } => ErrorCategory::CursorBoundary,
            CoreError::Decode { .. } => ErrorCategory::NonRetryable,
            CoreError::Downstream(_) => ErrorCategory::Cancelled,
            CoreError::Persistence(_) => ErrorCategory::Retryable(RetryAdvice::default()),
            CoreError::ControlPlane(_) => ErrorCategory::NonRetryable,
            CoreError::InvalidArgument(_) => ErrorCategory::NonRetryable,
            CoreError::SequenceGap { .. } => ErrorCategory::NonRetryable,
        }
    }
}

/// Structured classification driving automated recovery (spec §4.3, §7).
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    Retryable(RetryAdvice),
    NonRetryable,
    CursorBoundary,
    Cancelled,
    Timeout,
}

/// Baseline backoff advice attached to a retryable error. The actual wait is
/// computed adaptively by [`crate::governance::retry::compute_backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryAdvice {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for RetryAdvice {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}
