//! Transport boundary for talking to the control plane. `stage-controlplane`
//! does not hardcode a wire protocol; `stage-server` wires in the real gRPC
//! implementation generated from `stage-proto`.

use stage_core::CoreError;

use crate::model::{HeartbeatPayload, RegistrationRequest, RegistrationResponse};

#[async_trait::async_trait]
pub trait ControlPlaneTransport: Send + Sync {
    async fn register(&self, request: RegistrationRequest) -> Result<RegistrationResponse, CoreError>;
    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<(), CoreError>;

    /// Releases any held connection. No-op by default.
    async fn close(&self) {}
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Transport that fails `register` until `fail_registrations` have been
    /// attempted, then succeeds; every `heartbeat` succeeds and is recorded.
    pub struct FlakyTransport {
        fail_registrations: u32,
        register_attempts: AtomicU32,
        pub heartbeats: Mutex<Vec<HeartbeatPayload>>,
        pub registered: AtomicBool,
    }

    impl FlakyTransport {
        pub fn new(fail_registrations: u32) -> Self {
            Self {
                fail_registrations,
                register_attempts: AtomicU32::new(0),
                heartbeats: Mutex::new(Vec::new()),
                registered: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl ControlPlaneTransport for FlakyTransport {
        async fn register(&self, _request: RegistrationRequest) -> Result<RegistrationResponse, CoreError> {
            let attempt = self.register_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_registrations {
                return Err(CoreError::ControlPlane("registration refused".to_string()));
            }
            self.registered.store(true, Ordering::SeqCst);
            Ok(RegistrationResponse {
                service_id: "assigned-service-id".to_string(),
                assigned_topics: vec!["stellar.token.transfer.v1".to_string()],
                connection_info: "grpc://controlplane.internal:8443".to_string(),
            })
        }

        async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<(), CoreError> {
            self.heartbeats.lock().await.push(payload);
            Ok(())
        }
    }

    pub struct AlwaysFailsTransport;

    #[async_trait::async_trait]
    impl ControlPlaneTransport for AlwaysFailsTransport {
        async fn register(&self, _request: RegistrationRequest) -> Result<RegistrationResponse, CoreError> {
            Err(CoreError::ControlPlane("control plane unreachable".to_string()))
        }

        async fn heartbeat(&self, _payload: HeartbeatPayload) -> Result<(), CoreError> {
            Err(CoreError::ControlPlane("control plane unreachable".to_string()))
        }
    }
}
