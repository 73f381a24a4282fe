//! Stable `tracing` field names used across every stage (spec §7):
//! `component`, `version`, `ledger_sequence`, `stream_id`, `session_id`,
//! `err`. Keeping them as constants avoids drift between crates.

pub const COMPONENT: &str = "component";
pub const VERSION: &str = "version";
pub const LEDGER_SEQUENCE: &str = "ledger_sequence";
pub const STREAM_ID: &str = "stream_id";
pub const SESSION_ID: &str = "session_id";
pub const ERR: &str = "err";
