//! `FlightTransport`: the Arrow Flight `FlightService` implementation
//! (spec §4.5).
//!
//! Only the read-path verbs a consumer needs are implemented:
//! `GetFlightInfo`, `ListFlights`, `GetSchema`, `DoGet`. `AddBatch` and
//! `CloseStream` are plain Rust methods on [`FlightTransport`], called by
//! whatever produces batches (`stage-runtime`, `stage-sink`); they are not
//! part of the Flight RPC surface. `DoPut`/`DoExchange`/`DoAction`/
//! `ListActions` return `Unimplemented`, as this transport is
//! consumer-only.

use std::pin::Pin;
use std::sync::Arc;

use arrow::ipc::writer::IpcWriteOptions;
use arrow_array::RecordBatch;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::flight_service_server::FlightService;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, PutResult, SchemaAsIpc, SchemaResult, Ticket,
};
use futures::{Stream, StreamExt};
use stage_core::model::Ticket as DomainTicket;
use stage_core::observability::MetricsRegistry;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::registry::{StreamRegistry, StreamState};

pub type TonicStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[derive(Clone)]
pub struct FlightTransport {
    registry: Arc<StreamRegistry>,
    metrics: MetricsRegistry,
}

impl FlightTransport {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            registry: Arc::new(StreamRegistry::new()),
            metrics,
        }
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.clone()
    }

    pub fn publish_stream(&self, stream_id: impl Into<String>, schema: arrow_schema::SchemaRef) {
        self.registry.publish_stream(stream_id, schema);
    }

    pub fn add_batch(&self, stream_id: &str, batch: RecordBatch) -> Result<(), stage_core::CoreError> {
        self.registry.add_batch(stream_id, batch)
    }

    pub fn close_stream(&self, stream_id: &str) -> Option<crate::registry::StreamStats> {
        self.registry.close_stream(stream_id)
    }

    fn lookup(&self, stream_id: &str) -> Result<Arc<StreamState>, Status> {
        self.registry
            .get(stream_id)
            .ok_or_else(|| Status::not_found(format!("no such stream: {stream_id}")))
    }

    fn flight_info_for(&self, stream_id: &str, stream: &StreamState) -> Result<FlightInfo, Status> {
        let ticket = DomainTicket {
            stream_id: stream_id.to_string(),
            start_sequence: None,
            end_sequence: None,
            filter: None,
        };
        let endpoint = FlightEndpoint::new().with_ticket(Ticket::new(ticket.encode()));
        FlightInfo::new()
            .try_with_schema(stream.schema.as_ref())
            .map(|info| {
                info.with_descriptor(FlightDescriptor::new_path(vec![stream_id.to_string()]))
                    .with_endpoint(endpoint)
                    .with_total_records(-1)
                    .with_total_bytes(-1)
            })
            .map_err(|e| Status::internal(format!("failed to encode schema: {e}")))
    }
}

/// Decrements `flight_clients_connected` when a `DoGet` stream ends, by
/// whatever path it ends (clean finish, error, or a client disconnecting
/// mid-poll, which drops the generator without running any code after it).
struct ConnectedClientGuard {
    metrics: MetricsRegistry,
}

impl ConnectedClientGuard {
    fn new(metrics: MetricsRegistry) -> Self {
        Self { metrics }
    }
}

impl Drop for ConnectedClientGuard {
    fn drop(&mut self) {
        self.metrics.flight_clients_connected().dec();
    }
}

fn descriptor_to_stream_id(descriptor: &FlightDescriptor) -> Result<String, Status> {
    descriptor
        .path
        .first()
        .cloned()
        .ok_or_else(|| Status::invalid_argument("flight descriptor must carry a stream id path segment"))
}

#[tonic::async_trait]
impl FlightService for FlightTransport {
    type HandshakeStream = TonicStream<HandshakeResponse>;
    type ListFlightsStream = TonicStream<FlightInfo>;
    type DoGetStream = TonicStream<FlightData>;
    type DoPutStream = TonicStream<PutResult>;
    type DoActionStream = TonicStream<arrow_flight::Result>;
    type ListActionsStream = TonicStream<ActionType>;
    type DoExchangeStream = TonicStream<FlightData>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake is not supported"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        let registry = self.registry.clone();
        let this = self.clone();
        let stream_ids = registry.list_stream_ids();
        let infos: Vec<Result<FlightInfo, Status>> = stream_ids
            .into_iter()
            .filter_map(|stream_id| {
                let stream = registry.get(&stream_id)?;
                Some(this.flight_info_for(&stream_id, &stream))
            })
            .collect();
        Ok(Response::new(Box::pin(futures::stream::iter(infos))))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let stream_id = descriptor_to_stream_id(request.get_ref())?;
        let stream = self.lookup(&stream_id)?;
        let info = self.flight_info_for(&stream_id, &stream)?;
        Ok(Response::new(info))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let stream_id = descriptor_to_stream_id(request.get_ref())?;
        let stream = self.lookup(&stream_id)?;
        let options = IpcWriteOptions::default();
        let schema_result: SchemaResult = SchemaAsIpc::new(stream.schema.as_ref(), &options)
            .try_into()
            .map_err(|e: arrow_flight::error::FlightError| Status::internal(e.to_string()))?;
        Ok(Response::new(schema_result))
    }

    async fn do_get(&self, request: Request<Ticket>) -> Result<Response<Self::DoGetStream>, Status> {
        let ticket = DomainTicket::decode(&request.get_ref().ticket)
            .map_err(|e| Status::invalid_argument(format!("malformed ticket: {e}")))?;
        let stream = self.lookup(&ticket.stream_id)?;
        let schema = stream.schema.clone();
        let consumer_id = uuid::Uuid::new_v4().to_string();
        let consumer = stream.fanout.register_guarded(consumer_id.clone());

        debug!(stream_id = %ticket.stream_id, consumer_id = %consumer_id, "DoGet consumer registered");

        self.metrics.flight_clients_connected().inc();
        let client_guard = ConnectedClientGuard::new(self.metrics.clone());

        let stream_for_loop = stream.clone();
        let metrics = self.metrics.clone();
        let batch_stream = async_stream::stream! {
            // `consumer` and `client_guard` are dropped together at the end
            // of this generator's scope, whether it runs to completion or
            // is torn down mid-poll by a disconnecting client, so both the
            // fanout entry and the connected-client count are released
            // unconditionally.
            let consumer = consumer;
            let _client_guard = client_guard;
            loop {
                tokio::select! {
                    biased;
                    _ = stream_for_loop.close_signal.notified() => {
                        break;
                    }
                    item = consumer.recv() => {
                        match item {
                            Some(batch) => {
                                stream_for_loop.record_served(&batch).await;
                                metrics.records_streamed().inc();
                                yield Ok(batch);
                            }
                            None => break,
                        }
                    }
                }
            }
        };

        let flight_stream = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(batch_stream.map(|r: Result<RecordBatch, arrow_flight::error::FlightError>| r))
            .map(|result| result.map_err(|e| Status::internal(e.to_string())));

        Ok(Response::new(Box::pin(flight_stream)))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put is not supported; use AddBatch"))
    }

    async fn do_action(
        &self,
        _request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented("do_action is not supported"))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Err(Status::unimplemented("list_actions is not supported"))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use tonic::Request;

    fn test_schema() -> arrow_schema::SchemaRef {
        Arc::new(Schema::new(vec![Field::new("sequence", DataType::Int64, false)]))
    }

    fn test_batch(schema: arrow_schema::SchemaRef) -> RecordBatch {
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap()
    }

    #[tokio::test]
    async fn get_flight_info_reports_unknown_totals() {
        let transport = FlightTransport::new(MetricsRegistry::new("test_stage"));
        transport.publish_stream("stellar.ledger.raw.v1", test_schema());
        let descriptor = FlightDescriptor::new_path(vec!["stellar.ledger.raw.v1".to_string()]);
        let info = transport
            .get_flight_info(Request::new(descriptor))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.total_records, -1);
        assert_eq!(info.total_bytes, -1);
    }

    #[tokio::test]
    async fn get_flight_info_unknown_stream_is_not_found() {
        let transport = FlightTransport::new(MetricsRegistry::new("test_stage"));
        let descriptor = FlightDescriptor::new_path(vec!["missing".to_string()]);
        let result = transport.get_flight_info(Request::new(descriptor)).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn do_get_streams_published_batches() {
        let transport = FlightTransport::new(MetricsRegistry::new("test_stage"));
        let schema = test_schema();
        transport.publish_stream("stellar.ledger.raw.v1", schema.clone());
        transport.add_batch("stellar.ledger.raw.v1", test_batch(schema)).unwrap();

        let ticket = DomainTicket {
            stream_id: "stellar.ledger.raw.v1".to_string(),
            start_sequence: None,
            end_sequence: None,
            filter: None,
        }
        .encode();

        let mut response = transport
            .do_get(Request::new(Ticket::new(ticket)))
            .await
            .unwrap()
            .into_inner();

        let first = response.next().await;
        assert!(first.is_some());
    }

    #[tokio::test]
    async fn do_get_tracks_connected_clients_and_records_streamed() {
        let metrics = MetricsRegistry::new("test_stage_flight_metrics");
        let transport = FlightTransport::new(metrics.clone());
        let schema = test_schema();
        transport.publish_stream("stellar.ledger.raw.v1", schema.clone());
        transport.add_batch("stellar.ledger.raw.v1", test_batch(schema)).unwrap();

        let ticket = DomainTicket {
            stream_id: "stellar.ledger.raw.v1".to_string(),
            start_sequence: None,
            end_sequence: None,
            filter: None,
        }
        .encode();

        let mut response = transport
            .do_get(Request::new(Ticket::new(ticket)))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(metrics.flight_clients_connected().get(), 1);

        let first = response.next().await;
        assert!(first.is_some());
        assert_eq!(metrics.records_streamed().get(), 1);

        // Dropping the stream without reaching a `break` simulates a client
        // disconnecting mid-poll; the guard it carries must still release
        // the connected-client count.
        drop(response);
        assert_eq!(metrics.flight_clients_connected().get(), 0);
    }
}
