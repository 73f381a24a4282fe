//! Data model entities shared across every stage (spec §3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An ordered, contiguous ledger read from an upstream source.
///
/// Invariant: within a single stream, `sequence` values are strictly
/// increasing and contiguous. A gap is a fatal error the runtime must
/// detect (§3, §7 `Decode`/fatal classification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLedger {
    pub sequence: u32,
    pub network_passphrase: String,
    pub ledger_close_meta_xdr: Vec<u8>,
}

impl RawLedger {
    pub fn new(sequence: u32, network_passphrase: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            network_passphrase: network_passphrase.into(),
            ledger_close_meta_xdr: payload,
        }
    }
}

/// A domain event produced by a stage from one or more `RawLedger`s.
///
/// Invariant: `(event_type, cursor, intra_ledger_index)` is unique. Payload
/// decoding is left to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub cursor: u32,
    pub intra_ledger_index: u32,
    pub metadata: BTreeMap<String, String>,
    pub content_type: String,
    pub source_component_id: String,
}

impl DomainEvent {
    /// Derives a stable event id from the producing ledger sequence and the
    /// event's position within that ledger.
    pub fn derive_event_id(cursor: u32, intra_ledger_index: u32) -> String {
        format!("{cursor}-{intra_ledger_index}")
    }

    pub fn builder(
        event_type: impl Into<String>,
        cursor: u32,
        intra_ledger_index: u32,
        source_component_id: impl Into<String>,
    ) -> DomainEventBuilder {
        DomainEventBuilder::new(event_type, cursor, intra_ledger_index, source_component_id)
    }
}

/// Builder for [`DomainEvent`], mirroring the construction style used
/// throughout the workspace's typed contracts.
pub struct DomainEventBuilder {
    event_type: String,
    cursor: u32,
    intra_ledger_index: u32,
    source_component_id: String,
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
    content_type: String,
}

impl DomainEventBuilder {
    fn new(
        event_type: impl Into<String>,
        cursor: u32,
        intra_ledger_index: u32,
        source_component_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            cursor,
            intra_ledger_index,
            source_component_id: source_component_id.into(),
            payload: Vec::new(),
            metadata: BTreeMap::new(),
            content_type: "application/octet-stream".to_string(),
        }
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> DomainEvent {
        DomainEvent {
            event_id: DomainEvent::derive_event_id(self.cursor, self.intra_ledger_index),
            event_type: self.event_type,
            payload: self.payload,
            cursor: self.cursor,
            intra_ledger_index: self.intra_ledger_index,
            metadata: self.metadata,
            content_type: self.content_type,
            source_component_id: self.source_component_id,
        }
    }
}

/// A logical, Arrow-schema-typed stream owned by its publishing stage.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub name: String,
    pub schema_bytes: Vec<u8>,
}

/// Opaque Flight ticket, addressing a stream plus an optional ledger range
/// and filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub stream_id: String,
    pub start_sequence: Option<u32>,
    pub end_sequence: Option<u32>,
    pub filter: Option<Filter>,
}

impl Ticket {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Ticket serializes infallibly")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Per-stream resumable position (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub stream_id: String,
    pub last_processed_sequence: u32,
    pub last_processed_intra_ledger_index: u32,
    pub total_ledgers: u64,
    pub total_events: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_update_time: chrono::DateTime<chrono::Utc>,
}

impl Cursor {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            last_processed_sequence: 0,
            last_processed_intra_ledger_index: 0,
            total_ledgers: 0,
            total_events: 0,
            last_update_time: chrono::Utc::now(),
        }
    }
}

/// A compiled, side-effect-free predicate over [`DomainEvent`] attributes
/// (spec §3). Evaluation never fails and never mutates state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    pub event_types: Vec<String>,
    pub contract_ids: Vec<String>,
    pub asset_codes: Vec<String>,
    pub asset_issuers: Vec<String>,
    pub include_failed: bool,
    pub include_deleted: bool,
    pub include_diagnostics: bool,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
            && self.contract_ids.is_empty()
            && self.asset_codes.is_empty()
            && self.asset_issuers.is_empty()
    }

    /// Evaluate the filter against an event. Pure: no I/O, no panics, no
    /// mutation (spec §3 `Filter` invariant).
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| t == &event.event_type)
        {
            return false;
        }
        if !self.contract_ids.is_empty() {
            let contract_id = event.metadata.get("contract_id");
            match contract_id {
                Some(id) if self.contract_ids.iter().any(|c| c == id) => {}
                _ => return false,
            }
        }
        if !self.asset_codes.is_empty() {
            let asset_code = event.metadata.get("asset_code");
            match asset_code {
                Some(code) if self.asset_codes.iter().any(|c| c == code) => {}
                _ => return false,
            }
        }
        if !self.asset_issuers.is_empty() {
            let issuer = event.metadata.get("asset_issuer");
            match issuer {
                Some(issuer) if self.asset_issuers.iter().any(|i| i == issuer) => {}
                _ => return false,
            }
        }
        if !self.include_failed && event.metadata.get("successful").map(String::as_str) == Some("false")
        {
            return false;
        }
        if !self.include_deleted && event.metadata.get("deleted").map(String::as_str) == Some("true")
        {
            return false;
        }
        if !self.include_diagnostics
            && event.metadata.get("diagnostic").map(String::as_str) == Some("true")
        {
            return false;
        }
        true
    }
}

/// Lifecycle states of a [`ProcessingSession`] (spec §4.3). `Stopped` and
/// `Error` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }
}

/// A bounded or unbounded request for events, identified by its fingerprint.
#[derive(Debug, Clone)]
pub struct ProcessingSession {
    pub session_id: String,
    pub start_sequence: u32,
    pub end_sequence: u32,
    pub batch_size: usize,
    pub filter: Filter,
    pub state: SessionState,
    pub current_sequence: u32,
    pub last_error: Option<String>,
}

impl ProcessingSession {
    pub fn new(
        session_id: impl Into<String>,
        start_sequence: u32,
        end_sequence: u32,
        batch_size: usize,
        filter: Filter,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            start_sequence,
            end_sequence,
            batch_size,
            filter,
            state: SessionState::Starting,
            current_sequence: 0,
            last_error: None,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.end_sequence != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_empty_matches_everything() {
        let filter = Filter::default();
        let event = DomainEvent::builder("stellar.token.transfer.v1", 100, 0, "test").build();
        assert!(filter.matches(&event));
    }

    #[test]
    fn filter_excludes_failed_by_default() {
        let filter = Filter::default();
        let event = DomainEvent::builder("stellar.token.transfer.v1", 100, 0, "test")
            .metadata_entry("successful", "false")
            .build();
        assert!(!filter.matches(&event));

        let filter = Filter {
            include_failed: true,
            ..Default::default()
        };
        assert!(filter.matches(&event));
    }

    #[test]
    fn filter_matches_on_event_type_set() {
        let filter = Filter {
            event_types: vec!["stellar.token.transfer.v1".to_string()],
            ..Default::default()
        };
        let transfer = DomainEvent::builder("stellar.token.transfer.v1", 1, 0, "test").build();
        let mint = DomainEvent::builder("stellar.token.mint.v1", 1, 0, "test").build();
        assert!(filter.matches(&transfer));
        assert!(!filter.matches(&mint));
    }

    #[test]
    fn event_id_is_derived_from_cursor_and_intra_index() {
        let event = DomainEvent::builder("stellar.ledger.v1", 42, 3, "source").build();
        assert_eq!(event.event_id, "42-3");
    }

    #[test]
    fn ticket_round_trips_through_json() {
        let ticket = Ticket {
            stream_id: "stellar.token.transfer.v1".to_string(),
            start_sequence: Some(100),
            end_sequence: None,
            filter: Some(Filter::default()),
        };
        let encoded = ticket.encode();
        let decoded = Ticket::decode(&encoded).unwrap();
        assert_eq!(decoded.stream_id, ticket.stream_id);
        assert_eq!(decoded.start_sequence, ticket.start_sequence);
    }

    #[test]
    fn session_terminal_states() {
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }
}
