//! Fans a processed batch out to every downstream output a stage can have
//! wired up at once: the in-process fanout that feeds `DomainEventStream`
//! gRPC subscribers, the Arrow Flight transport, and a row-store sink
//! (spec §4.3 step 3e, §4.5, §4.6).
//!
//! Each output is optional; a stage deployed purely as a Flight producer
//! carries no sink, one deployed purely to a database carries no Flight
//! schema. `StageRuntime` only ever sees the single [`DomainEventPublisher`]
//! boundary.

use std::sync::Arc;

use arrow_array::builder::{BinaryBuilder, StringBuilder, UInt32Builder};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use stage_core::{CoreError, DomainEvent};
use stage_flight::FlightTransport;
use stage_runtime::{DomainEventPublisher, FanoutPublisher};
use stage_sink::SinkEngine;
use tracing::warn;

pub fn flight_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("event_id", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("payload", DataType::Binary, false),
        Field::new("cursor", DataType::UInt32, false),
        Field::new("intra_ledger_index", DataType::UInt32, false),
        Field::new("metadata_json", DataType::Utf8, false),
        Field::new("content_type", DataType::Utf8, false),
        Field::new("source_component_id", DataType::Utf8, false),
    ]))
}

fn to_record_batch(schema: &SchemaRef, batch: &[DomainEvent]) -> Option<RecordBatch> {
    if batch.is_empty() {
        return None;
    }

    let mut event_id = StringBuilder::new();
    let mut event_type = StringBuilder::new();
    let mut payload = BinaryBuilder::new();
    let mut cursor = UInt32Builder::new();
    let mut intra_ledger_index = UInt32Builder::new();
    let mut metadata_json = StringBuilder::new();
    let mut content_type = StringBuilder::new();
    let mut source_component_id = StringBuilder::new();

    for event in batch {
        event_id.append_value(&event.event_id);
        event_type.append_value(&event.event_type);
        payload.append_value(&event.payload);
        cursor.append_value(event.cursor);
        intra_ledger_index.append_value(event.intra_ledger_index);
        metadata_json.append_value(
            serde_json::to_string(&event.metadata).unwrap_or_default(),
        );
        content_type.append_value(&event.content_type);
        source_component_id.append_value(&event.source_component_id);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(event_id.finish()),
        Arc::new(event_type.finish()),
        Arc::new(payload.finish()),
        Arc::new(cursor.finish()),
        Arc::new(intra_ledger_index.finish()),
        Arc::new(metadata_json.finish()),
        Arc::new(content_type.finish()),
        Arc::new(source_component_id.finish()),
    ];

    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|err| warn!(err = %err, "failed to build Flight record batch"))
        .ok()
}

pub struct CombinedPublisher {
    fanout: FanoutPublisher,
    flight: Option<(Arc<FlightTransport>, String, SchemaRef)>,
    sink: Option<Arc<SinkEngine>>,
}

impl CombinedPublisher {
    pub fn new(fanout: FanoutPublisher) -> Self {
        Self {
            fanout,
            flight: None,
            sink: None,
        }
    }

    pub fn with_flight(mut self, flight: Arc<FlightTransport>, stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        let schema = flight_schema();
        flight.publish_stream(stream_id.clone(), schema.clone());
        self.flight = Some((flight, stream_id, schema));
        self
    }

    pub fn with_sink(mut self, sink: Arc<SinkEngine>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[async_trait::async_trait]
impl DomainEventPublisher for CombinedPublisher {
    async fn publish(&self, batch: Vec<DomainEvent>) -> Result<(), CoreError> {
        if let Some((flight, stream_id, schema)) = &self.flight {
            if let Some(record_batch) = to_record_batch(schema, &batch) {
                if let Err(err) = flight.add_batch(stream_id, record_batch) {
                    warn!(stream_id = %stream_id, err = %err, "failed to publish batch to Flight transport");
                }
            }
        }

        if let Some(sink) = &self.sink {
            for event in &batch {
                // `SinkEngine::ingest` has already exhausted its own retry
                // budget by the time it returns `Err`; there is no partial
                // durability to preserve by continuing (spec §4.6).
                sink.ingest(event).await?;
            }
        }

        self.fanout.publish(batch).await
    }
}
