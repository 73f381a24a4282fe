//! Process entry point: wires `CursorStore`, `BoundedFanout`,
//! `StageRuntime`, `ControlPlaneClient`, `FlightTransport` and `SinkEngine`
//! into one runnable stage (spec §6 Deployment, §5 task inventory).
//!
//! Exit codes (spec §6): `0` on a clean stop, `1` on a fatal startup
//! failure (bad config, cursor/transport that can't be opened), `2` when
//! the processing session itself ends in `Error` after retries are
//! exhausted.

mod cli;
mod grpc_controlplane;
mod grpc_downstream;
mod grpc_upstream;
mod health;
mod outputs;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use stage_controlplane::{ControlPlaneClient, RegistrationRequest, ServiceType};
use stage_core::configuration::StageConfig;
use stage_core::model::SessionState;
use stage_core::observability::MetricsRegistry;
use stage_cursor::CursorStore;
use stage_fanout::BoundedFanout;
use stage_flight::FlightTransport;
use stage_runtime::{FanoutPublisher, PassthroughDecoder, StageRuntime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Bound on how long shutdown waits for the in-flight session to reach a
/// terminal state before the process exits anyway (spec §5 "Cancellation").
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();

    let config = match StageConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            // Tracing isn't initialized yet if config loading itself failed;
            // this is the one place the binary writes straight to stderr.
            eprintln!("fatal: invalid configuration: {err}");
            return ExitCode::from(1);
        }
    };

    if args.print_config {
        println!("{config:#?}");
        return ExitCode::SUCCESS;
    }

    init_tracing();

    match run(config).await {
        Ok(RunOutcome::Stopped) => ExitCode::SUCCESS,
        Ok(RunOutcome::Errored) => ExitCode::from(2),
        Err(err) => {
            error!(err = %err, "fatal startup error");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

enum RunOutcome {
    Stopped,
    Errored,
}

async fn run(config: StageConfig) -> Result<RunOutcome, stage_core::CoreError> {
    let metrics = MetricsRegistry::new(&config.component_id);
    let cursor_store = Arc::new(CursorStore::open(PathBuf::from(&config.checkpoint_path), "primary").await);

    let fanout = Arc::new(BoundedFanout::default());
    let flight = Arc::new(FlightTransport::new(metrics.clone()));

    let publisher = outputs::CombinedPublisher::new(FanoutPublisher::new(fanout.clone()))
        .with_flight(flight.clone(), config.component_id.clone());

    let upstream = Arc::new(grpc_upstream::GrpcUpstream::new(config.source_endpoint.clone()));
    let decoder = Arc::new(PassthroughDecoder);
    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = Arc::new(StageRuntime::new(
        upstream,
        decoder,
        cursor_store.clone(),
        Arc::new(publisher),
        metrics.clone(),
        worker_count,
        config.commit_interval(),
    ));

    let session_id = runtime
        .start_processing(
            config.start_ledger,
            config.end_ledger,
            config.batch_size,
            config.filter(),
        )
        .await?;
    info!(session_id = %session_id, start = config.start_ledger, end = config.end_ledger, "processing session started");

    let control_plane = if config.enable_flowctl {
        let transport = Arc::new(grpc_controlplane::GrpcControlPlane::new(config.flowctl_endpoint.clone()));
        let client = Arc::new(ControlPlaneClient::new(config.component_id.clone(), transport, metrics.clone()));
        let request = RegistrationRequest {
            service_type: ServiceType::Processor,
            input_event_types: config.filter_event_types.clone(),
            output_event_types: config.filter_event_types.clone(),
            health_endpoint: format!("http://0.0.0.0:{}/health", config.health_port),
            max_inflight: config.batch_size as u32,
            metadata: Default::default(),
        };
        let response = client.register(request).await;
        info!(service_id = %response.service_id, degraded = client.is_degraded().await, "control plane registration complete");
        client.start_heartbeat(config.flowctl_heartbeat_interval());
        Some(client)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(health::AppState {
        metrics: metrics.clone(),
        runtime: runtime.clone(),
        session_id: session_id.clone(),
        component: config.component_id.clone(),
    });

    let health_server = spawn_health_server(config.health_port, app_state.clone(), shutdown.clone());
    let grpc_server = spawn_grpc_server(config.port, flight, fanout, shutdown.clone());

    wait_for_shutdown_or_completion(&runtime, &session_id, shutdown.clone()).await;

    if let Some(client) = &control_plane {
        client.stop().await;
    }

    let _ = tokio::join!(health_server, grpc_server);

    let final_state = runtime
        .get_status(&session_id)
        .await
        .map(|status| status.state)
        .unwrap_or(SessionState::Error);

    match final_state {
        SessionState::Stopped => Ok(RunOutcome::Stopped),
        _ => Ok(RunOutcome::Errored),
    }
}

/// Runs until either an OS shutdown signal arrives (propagated as a
/// `stop_processing` call with a bounded wait for the session to settle) or
/// the session reaches a terminal state on its own, as happens for a
/// bounded `end_ledger` run.
async fn wait_for_shutdown_or_completion(runtime: &StageRuntime, session_id: &str, shutdown: CancellationToken) {
    let signal = async {
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    };

    tokio::select! {
        _ = signal => {
            info!("shutdown signal received, stopping processing session");
            let _ = runtime.stop_processing(session_id).await;
            wait_for_terminal(runtime, session_id).await;
        }
        _ = wait_for_terminal(runtime, session_id) => {
            info!("processing session reached a terminal state on its own");
        }
    }

    shutdown.cancel();
}

async fn wait_for_terminal(runtime: &StageRuntime, session_id: &str) {
    let deadline = tokio::time::sleep(SHUTDOWN_BUDGET);
    tokio::pin!(deadline);
    loop {
        match runtime.get_status(session_id).await {
            Ok(status) if status.state.is_terminal() => return,
            Ok(_) => {}
            Err(_) => return,
        }
        tokio::select! {
            _ = &mut deadline => {
                error!("session did not reach a terminal state within the shutdown budget, exiting anyway");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
}

fn spawn_health_server(
    port: u16,
    state: Arc<health::AppState>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let router = health::router(state);
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(err = %err, port, "failed to bind health server");
                return;
            }
        };
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        });
        if let Err(err) = serve.await {
            error!(err = %err, "health server exited with an error");
        }
    })
}

fn spawn_grpc_server(
    port: u16,
    flight: Arc<FlightTransport>,
    fanout: Arc<BoundedFanout<stage_core::DomainEvent>>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = match format!("0.0.0.0:{port}").parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(err = %err, port, "invalid gRPC bind address");
                return;
            }
        };
        let flight_service = arrow_flight::flight_service_server::FlightServiceServer::new((*flight).clone());
        let domain_event_service = stage_proto::domain_event_stream_server::DomainEventStreamServer::new(
            grpc_downstream::DomainEventService::new(fanout),
        );
        let server = tonic::transport::Server::builder()
            .add_service(flight_service)
            .add_service(domain_event_service)
            .serve_with_shutdown(addr, async move {
                shutdown.cancelled().await;
            });
        if let Err(err) = server.await {
            error!(err = %err, "gRPC server exited with an error");
        }
    })
}
