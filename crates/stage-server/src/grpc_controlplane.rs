//! `ControlPlaneTransport` backed by the generated `ControlPlane` gRPC
//! client (spec §4.4, §6 `FLOWCTL_ENDPOINT`).

use std::collections::BTreeMap;

use stage_controlplane::{ControlPlaneTransport, HeartbeatPayload, RegistrationRequest, RegistrationResponse, ServiceType};
use stage_core::CoreError;
use tonic::transport::Channel;

use stage_proto::control_plane_client::ControlPlaneClient;
use stage_proto::{HeartbeatRequest, RegisterRequest};

pub struct GrpcControlPlane {
    endpoint: String,
}

impl GrpcControlPlane {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    async fn connect(&self) -> Result<ControlPlaneClient<Channel>, CoreError> {
        let channel = Channel::from_shared(self.endpoint.clone())
            .map_err(|e| CoreError::ControlPlane(e.to_string()))?
            .connect()
            .await
            .map_err(|e| CoreError::ControlPlane(e.to_string()))?;
        Ok(ControlPlaneClient::new(channel))
    }
}

#[async_trait::async_trait]
impl ControlPlaneTransport for GrpcControlPlane {
    async fn register(&self, request: RegistrationRequest) -> Result<RegistrationResponse, CoreError> {
        let mut client = self.connect().await?;
        let proto_request = RegisterRequest {
            service_type: map_service_type(request.service_type) as i32,
            input_event_types: request.input_event_types,
            output_event_types: request.output_event_types,
            health_endpoint: request.health_endpoint,
            max_inflight: request.max_inflight,
            metadata: request.metadata.into_iter().collect(),
        };
        let response = client
            .register(proto_request)
            .await
            .map_err(|e| CoreError::ControlPlane(e.to_string()))?
            .into_inner();
        Ok(RegistrationResponse {
            service_id: response.service_id,
            assigned_topics: response.assigned_topics,
            connection_info: response.connection_info,
        })
    }

    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<(), CoreError> {
        let mut client = self.connect().await?;
        let proto_payload = HeartbeatRequest {
            service_id: payload.service_id,
            timestamp: payload.timestamp,
            metrics: flatten_metrics(payload.metrics),
        };
        client
            .heartbeat(proto_payload)
            .await
            .map_err(|e| CoreError::ControlPlane(e.to_string()))?;
        Ok(())
    }
}

fn map_service_type(service_type: ServiceType) -> stage_proto::ServiceType {
    match service_type {
        ServiceType::Source => stage_proto::ServiceType::Source,
        ServiceType::Processor => stage_proto::ServiceType::Processor,
        ServiceType::Sink => stage_proto::ServiceType::Sink,
    }
}

fn flatten_metrics(metrics: BTreeMap<String, f64>) -> std::collections::HashMap<String, f64> {
    metrics.into_iter().collect()
}
