//! `ControlPlaneClient`: registration plus periodic heartbeat, with a
//! degraded mode that keeps the stage fully operational when the control
//! plane is unreachable (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use stage_core::observability::MetricsRegistry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::{HeartbeatPayload, RegistrationRequest, RegistrationResponse};
use crate::transport::ControlPlaneTransport;

#[derive(Debug, Clone)]
struct ClientState {
    service_id: String,
    assigned_topics: Vec<String>,
    degraded: bool,
}

pub struct ControlPlaneClient {
    component: String,
    transport: Arc<dyn ControlPlaneTransport>,
    metrics: MetricsRegistry,
    state: Arc<RwLock<ClientState>>,
    heartbeat_cancel: CancellationToken,
}

impl ControlPlaneClient {
    pub fn new(component: impl Into<String>, transport: Arc<dyn ControlPlaneTransport>, metrics: MetricsRegistry) -> Self {
        Self {
            component: component.into(),
            transport,
            metrics,
            state: Arc::new(RwLock::new(ClientState {
                service_id: String::new(),
                assigned_topics: Vec::new(),
                degraded: false,
            })),
            heartbeat_cancel: CancellationToken::new(),
        }
    }

    /// Registers with the control plane. On failure, synthesizes a local
    /// service id (`sim-<component>-<timestamp>`) and silently enters
    /// degraded mode rather than returning an error: the control plane is
    /// strictly advisory (spec §4.4 "Degraded mode").
    pub async fn register(&self, request: RegistrationRequest) -> RegistrationResponse {
        match self.transport.register(request).await {
            Ok(response) => {
                info!(component = %self.component, service_id = %response.service_id, "registered with control plane");
                let mut state = self.state.write().await;
                state.service_id = response.service_id.clone();
                state.assigned_topics = response.assigned_topics.clone();
                state.degraded = false;
                response
            }
            Err(err) => {
                let service_id = synthesize_service_id(&self.component);
                warn!(component = %self.component, err = %err, service_id = %service_id, "control plane unreachable, entering degraded mode");
                let mut state = self.state.write().await;
                state.service_id = service_id.clone();
                state.assigned_topics = Vec::new();
                state.degraded = true;
                RegistrationResponse {
                    service_id,
                    assigned_topics: Vec::new(),
                    connection_info: String::new(),
                }
            }
        }
    }

    pub async fn is_degraded(&self) -> bool {
        self.state.read().await.degraded
    }

    pub async fn service_id(&self) -> String {
        self.state.read().await.service_id.clone()
    }

    /// Launches a background heartbeat emitter. Heartbeat failures are
    /// logged and counted but never stop the loop (spec §4.4 "continues
    /// heartbeat attempts silently").
    pub fn start_heartbeat(&self, interval: Duration) {
        let state = self.state.clone();
        let transport = self.transport.clone();
        let metrics = self.metrics.clone();
        let cancel = self.heartbeat_cancel.clone();
        let component = self.component.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let service_id = state.read().await.service_id.clone();
                        if service_id.is_empty() {
                            continue;
                        }
                        let payload = HeartbeatPayload {
                            service_id,
                            timestamp: chrono::Utc::now().timestamp(),
                            metrics: metrics.snapshot_flat(),
                        };
                        match transport.heartbeat(payload).await {
                            Ok(()) => metrics.heartbeats_sent().inc(),
                            Err(err) => {
                                warn!(component = %component, err = %err, "heartbeat failed");
                                metrics.heartbeats_errored().inc();
                            }
                        }
                    }
                }
            }
        });
    }

    /// Cancels the heartbeat loop and releases the transport connection.
    pub async fn stop(&self) {
        self.heartbeat_cancel.cancel();
        self.transport.close().await;
    }
}

fn synthesize_service_id(component: &str) -> String {
    format!("sim-{component}-{}", chrono::Utc::now().timestamp())
}
