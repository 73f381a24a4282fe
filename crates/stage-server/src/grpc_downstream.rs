//! `DomainEventStream` gRPC server: the row-by-row downstream publish path
//! (spec §4.3 step 3e, the alternative to `FlightTransport` for a stage
//! that wants individual events rather than Arrow batches).

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use stage_core::{DomainEvent, Filter};
use stage_fanout::BoundedFanout;
use tonic::{Request, Response, Status};

use stage_proto::domain_event_stream_server::DomainEventStream as DomainEventStreamTrait;
use stage_proto::{DomainEvent as ProtoDomainEvent, SubscribeDomainEventsRequest};

pub struct DomainEventService {
    fanout: Arc<BoundedFanout<DomainEvent>>,
}

impl DomainEventService {
    pub fn new(fanout: Arc<BoundedFanout<DomainEvent>>) -> Self {
        Self { fanout }
    }
}

#[tonic::async_trait]
impl DomainEventStreamTrait for DomainEventService {
    type SubscribeDomainEventsStream =
        Pin<Box<dyn Stream<Item = Result<ProtoDomainEvent, Status>> + Send + 'static>>;

    async fn subscribe_domain_events(
        &self,
        request: Request<SubscribeDomainEventsRequest>,
    ) -> Result<Response<Self::SubscribeDomainEventsStream>, Status> {
        let filter = request
            .into_inner()
            .filters
            .map(proto_filter_to_domain)
            .unwrap_or_default();

        let consumer_id = uuid::Uuid::new_v4().to_string();
        let consumer = self.fanout.register_guarded(consumer_id);

        let stream = async_stream::stream! {
            // `consumer` unregisters itself on drop, covering both a normal
            // end-of-stream and a client disconnecting mid-poll.
            let consumer = consumer;
            loop {
                match consumer.recv().await {
                    Some(event) => {
                        if filter.matches(&event) {
                            yield Ok(to_proto_event(event));
                        }
                    }
                    None => break,
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}

fn proto_filter_to_domain(filter: stage_proto::EventFilter) -> Filter {
    Filter {
        event_types: filter.event_types,
        contract_ids: filter.contract_ids,
        asset_codes: filter.asset_codes,
        asset_issuers: filter.asset_issuers,
        include_failed: filter.include_failed,
        include_deleted: filter.include_deleted,
        include_diagnostics: filter.include_diagnostics,
    }
}

fn to_proto_event(event: DomainEvent) -> ProtoDomainEvent {
    ProtoDomainEvent {
        event_id: event.event_id,
        event_type: event.event_type,
        payload: event.payload,
        cursor: event.cursor,
        intra_ledger_index: event.intra_ledger_index,
        metadata: event.metadata.into_iter().collect(),
        content_type: event.content_type,
        source_component_id: event.source_component_id,
    }
}
