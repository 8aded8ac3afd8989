//! Prometheus exporter for TP-Link Tapo smart plugs.
//!
//! Reads a device inventory, keeps one poll loop per plug running through
//! [`tapo_core::DeviceSupervisor`], and serves the latest readings on
//! `/metrics`.

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use prometheus_client::{encoding::text::encode, registry::Registry};
use tapo_core::{
    ClientOptions, Credentials, DeviceEvent, DeviceSupervisor, Error, SupervisorBuilder,
    SupervisorConfig,
};
use tokio::sync::{RwLock, broadcast};
use tracing::{Instrument, debug, error, info, info_span, warn};

mod config;
mod metrics;

use config::Inventory;
use metrics::{DeviceLabels, DeviceMetrics, PrometheusSink};

/// Prometheus exporter for TP-Link Tapo smart plugs.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Device inventory file (TOML)
    #[arg(short, long, env = "TAPO_CONFIG")]
    config: PathBuf,

    /// Account username for devices without their own credentials
    #[arg(short, long, env = "TAPO_USERNAME")]
    username: Option<String>,

    /// Account password for devices without their own credentials
    #[arg(short, long, env = "TAPO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:9102")]
    listen: SocketAddr,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "5")]
    request_timeout: u64,

    /// Consecutive failures before a device is reported offline
    #[arg(long, default_value = "3")]
    offline_threshold: u32,
}

/// Shared application state
struct AppState {
    registry: RwLock<Registry>,
    supervisor: Arc<DeviceSupervisor>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let inventory = Inventory::load(&cli.config)?;
    let default_credentials = match (&cli.username, &cli.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        (None, None) => None,
        _ => {
            return Err(Error::Configuration(
                "--username and --password must be given together".into(),
            ));
        }
    };
    let devices = inventory.device_configs(default_credentials.as_ref())?;

    let mut registry = Registry::default();
    let metrics = DeviceMetrics::new(&mut registry);

    let config = SupervisorConfig {
        offline_threshold: cli.offline_threshold.max(1),
        client: ClientOptions {
            connect_timeout: Duration::from_secs(cli.connect_timeout),
            request_timeout: Duration::from_secs(cli.request_timeout),
            ..ClientOptions::default()
        },
        ..SupervisorConfig::default()
    };
    let supervisor = Arc::new(
        SupervisorBuilder::new()
            .config(config)
            .sink(Arc::new(PrometheusSink::new(metrics.clone())))
            .span(info_span!("supervisor"))
            .build(),
    );

    tokio::spawn(
        track_health(Arc::clone(&supervisor), metrics, supervisor.subscribe())
            .instrument(info_span!("health")),
    );

    info!("Adding {} devices from {}", devices.len(), cli.config.display());
    for device in devices {
        let device_id = device.device_id.clone();
        // One unreachable plug must not keep the rest from being monitored.
        if let Err(e) = supervisor.add_device(device).await {
            warn!(device_id = %device_id, error = %e, "Failed to add device");
        }
    }

    let state = Arc::new(AppState {
        registry: RwLock::new(registry),
        supervisor: Arc::clone(&supervisor),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/devices", get(devices_handler))
        .with_state(state);

    info!("Starting tapo-poller on {}", cli.listen);
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .map_err(|e| Error::Configuration(format!("cannot listen on {}: {}", cli.listen, e)))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor.stop().await;
    served.map_err(|e| Error::Connection(e.to_string()))
}

/// Mirrors supervisor events onto the health gauges.
async fn track_health(
    supervisor: Arc<DeviceSupervisor>,
    metrics: DeviceMetrics,
    mut events: broadcast::Receiver<DeviceEvent>,
) {
    let mut labels: HashMap<String, DeviceLabels> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream lagged; resyncing health gauges");
                for status in supervisor.get_device_status() {
                    metrics.record_status(&status);
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            DeviceEvent::Removed { device_id } => {
                if let Some(labels) = labels.remove(device_id) {
                    metrics.forget(&labels);
                }
                debug!(device_id = %device_id, "Dropped metrics of removed device");
            }
            event if DeviceMetrics::affects_health(event) => {
                if let Some(status) = supervisor.device_status(event.device_id()) {
                    labels
                        .entry(status.device_id.clone())
                        .or_insert_with(|| DeviceLabels::from(&status));
                    metrics.record_status(&status);
                }
            }
            _ => {}
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

async fn index_handler() -> impl IntoResponse {
    let html = r#"<!DOCTYPE html>
<html>
<head>
    <title>Tapo Poller</title>
</head>
<body>
    <h1>Tapo Poller</h1>
    <p>Prometheus exporter for TP-Link Tapo smart plugs.</p>
    <ul>
        <li><a href="/metrics">Metrics</a></li>
        <li><a href="/devices">Devices</a></li>
        <li><a href="/health">Health</a></li>
    </ul>
</body>
</html>"#;

    (StatusCode::OK, [("content-type", "text/html")], html)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Metrics handler - returns Prometheus exposition format
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.registry.read().await;
    let mut buffer = String::new();

    match encode(&mut buffer, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Error encoding metrics: {}", e),
        ),
    }
}

/// Status snapshot of every device as JSON.
async fn devices_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.get_device_status())
}
