//! Wire-level shapes for control-plane registration and heartbeat (spec
//! §4.4). The transport that actually carries these is pluggable; see
//! [`crate::transport::ControlPlaneTransport`].

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Source,
    Processor,
    Sink,
}

#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub service_type: ServiceType,
    pub input_event_types: Vec<String>,
    pub output_event_types: Vec<String>,
    pub health_endpoint: String,
    pub max_inflight: u32,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RegistrationResponse {
    pub service_id: String,
    pub assigned_topics: Vec<String>,
    pub connection_info: String,
}

#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    pub service_id: String,
    pub timestamp: i64,
    pub metrics: BTreeMap<String, f64>,
}
