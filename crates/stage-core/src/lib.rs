//! Shared kernel for the Stellar staged streaming toolkit.
//!
//! This crate carries no business logic of its own. It defines the data
//! model (§3 of the design spec), the error taxonomy (§7), a small
//! observability facade for structured logging keys, and the governance
//! primitives (adaptive retry, timeout profiles) that every stage crate in
//! the workspace builds on.

pub mod configuration;
pub mod error;
pub mod governance;
pub mod model;
pub mod observability;

pub use error::{CoreError, ErrorCategory, Result};
pub use model::{
    Cursor, DomainEvent, Filter, ProcessingSession, RawLedger, SessionState, StreamDescriptor,
    Ticket,
};
