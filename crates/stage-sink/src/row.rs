//! Typed row derived from a [`stage_core::DomainEvent`] (spec §4.6).
//!
//! Invariant: `primary_key` is a deterministic function of
//! `(ledger_sequence, intra_ledger_index, event_type)`, so replaying the
//! same events after a recovery produces the same key and upserts in
//! place rather than duplicating (spec §4.6 "Idempotency").

use std::collections::BTreeMap;

use serde_json::Value;
use stage_core::{CoreError, DomainEvent};

#[derive(Debug, Clone)]
pub struct SinkRow {
    pub table: String,
    pub primary_key: String,
    pub cursor: u32,
    pub columns: BTreeMap<String, Value>,
}

impl SinkRow {
    pub fn column_str(&self, key: &str) -> &str {
        self.columns.get(key).and_then(Value::as_str).unwrap_or_default()
    }
}

/// Maps a decoded domain event into zero or more rows bound for a sink.
/// Kept as a trait (rather than a single free function) so a stage can
/// plug in a schema-specific mapper without changing `SinkEngine`.
pub trait RowMapper: Send + Sync {
    fn map_event(&self, event: &DomainEvent) -> Result<Vec<SinkRow>, CoreError>;
}

/// Maps every `DomainEvent` to a single row in a generic `domain_events`
/// table, preserving the event's metadata and raw payload verbatim. Used
/// when a stage has no schema-specific mapping of its own.
pub struct DefaultRowMapper;

impl RowMapper for DefaultRowMapper {
    fn map_event(&self, event: &DomainEvent) -> Result<Vec<SinkRow>, CoreError> {
        let mut columns = BTreeMap::new();
        columns.insert("event_type".to_string(), Value::String(event.event_type.clone()));
        columns.insert(
            "intra_ledger_index".to_string(),
            Value::Number(event.intra_ledger_index.into()),
        );
        columns.insert(
            "content_type".to_string(),
            Value::String(event.content_type.clone()),
        );
        columns.insert(
            "payload".to_string(),
            serde_json::to_value(&event.payload).map_err(|e| CoreError::Decode {
                sequence: event.cursor,
                reason: e.to_string(),
            })?,
        );
        columns.insert(
            "metadata".to_string(),
            serde_json::to_value(&event.metadata).map_err(|e| CoreError::Decode {
                sequence: event.cursor,
                reason: e.to_string(),
            })?,
        );
        columns.insert(
            "source_component_id".to_string(),
            Value::String(event.source_component_id.clone()),
        );

        Ok(vec![SinkRow {
            table: "domain_events".to_string(),
            primary_key: event.event_id.clone(),
            cursor: event.cursor,
            columns,
        }])
    }
}
