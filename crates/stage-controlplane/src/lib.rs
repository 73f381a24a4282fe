//! Registers a stage with the external control plane and publishes
//! periodic heartbeats (spec §4.4). The control plane is strictly
//! advisory: when it is unreachable the client degrades to a locally
//! synthesized service id and keeps the stage fully operational.

pub mod client;
pub mod model;
pub mod transport;

pub use client::ControlPlaneClient;
pub use model::{HeartbeatPayload, RegistrationRequest, RegistrationResponse, ServiceType};
pub use transport::ControlPlaneTransport;
