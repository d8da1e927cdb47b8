//! DRBD Controller
//!
//! Runs the definition-mutation pipeline behind its REST API, together with
//! a health endpoint and a Prometheus metrics endpoint.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drbd_controller::{
    AccessContext, ApiServer, ApiServerConfig, Controller, ControllerConfig, DurableStoreRef,
    Error, HttpSatelliteChannel, JsonFileStore, MemoryStore, Result, SatelliteEndpoint,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// DRBD Controller - volume definition pipeline for a DRBD storage cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:3370")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Directory of the controller database
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/drbd-controller")]
    data_dir: PathBuf,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long, env = "IN_MEMORY")]
    in_memory: bool,

    /// Satellite endpoint as node=url, repeatable
    #[arg(long = "satellite", env = "SATELLITES", value_delimiter = ',')]
    satellites: Vec<String>,

    /// Seconds a satellite gets to acknowledge an update
    #[arg(long, env = "SATELLITE_TIMEOUT", default_value = "30")]
    satellite_timeout_secs: u64,

    /// Master passphrase entered at start-up
    #[arg(long, env = "MASTER_PASSPHRASE", hide_env_values = true)]
    master_passphrase: Option<String>,

    /// Bearer token granting REST callers administrative rights
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting DRBD Controller");
    info!("  Version: {}", drbd_controller::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Satellites: {}", args.satellites.len());

    let satellite_timeout = Duration::from_secs(args.satellite_timeout_secs);
    let config = ControllerConfig {
        satellite_timeout,
        data_dir: (!args.in_memory).then(|| args.data_dir.clone()),
        admin_token: args.admin_token.clone(),
        ..Default::default()
    };
    if config.admin_token.is_none() {
        warn!("No admin token configured, REST callers cannot perform privileged operations");
    }

    // Open the durable store
    let store: DurableStoreRef = match &config.data_dir {
        Some(dir) => {
            info!("Using JSON file store in {}", dir.display());
            Arc::new(JsonFileStore::open(dir).await?)
        }
        None => {
            warn!("Using in-memory store, state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    // Satellite channel
    let endpoints = args
        .satellites
        .iter()
        .map(|entry| SatelliteEndpoint::parse(entry))
        .collect::<Result<Vec<_>>>()?;
    let channel = Arc::new(HttpSatelliteChannel::new(endpoints, satellite_timeout)?);

    let controller = Controller::open(config, store, channel).await?;
    info!("Controller initialized");

    if let Some(passphrase) = &args.master_passphrase {
        let rc = controller
            .enter_passphrase(&AccessContext::system(), passphrase)
            .await;
        if rc.has_errors() {
            error!("Master passphrase rejected, encrypted volumes are unavailable");
        }
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_controller = controller.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_controller).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
        ..Default::default()
    };

    let api_server = Arc::new(ApiServer::new(api_config, controller));

    let shutdown_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown_server.shutdown();
        }
    });

    info!("Starting API server");
    api_server.run().await?;

    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,tower=warn,axum=info",
            level
        ))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let mut response = Response::new(Body::empty());
            match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => {
                    *response.body_mut() = Body::from("ok");
                }
                _ => {
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    *response.body_mut() = Body::from("not found");
                }
            }
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Pipeline metrics in Prometheus form, brought up to date on every scrape
struct PipelineCollectors {
    requests: IntCounter,
    created: IntCounter,
    commits: IntCounter,
    rejected: IntCounterVec,
    satellite_updates: IntCounterVec,
    lock_wait_us: IntCounter,
    master_key: IntGauge,
}

/// Advance a counter to a monotonic total
fn advance(counter: &IntCounter, total: u64) {
    counter.inc_by(total.saturating_sub(counter.get()));
}

impl PipelineCollectors {
    fn register() -> std::result::Result<Self, prometheus::Error> {
        Ok(Self {
            requests: register_int_counter!(
                "drbd_controller_requests_total",
                "Volume definition requests received"
            )?,
            created: register_int_counter!(
                "drbd_controller_volume_definitions_created_total",
                "Volume definitions committed"
            )?,
            commits: register_int_counter!(
                "drbd_controller_commits_total",
                "Durable store commits"
            )?,
            rejected: register_int_counter_vec!(
                "drbd_controller_rejected_total",
                "Rejected requests by error kind",
                &["kind"]
            )?,
            satellite_updates: register_int_counter_vec!(
                "drbd_controller_satellite_updates_total",
                "Satellite updates by outcome",
                &["outcome"]
            )?,
            lock_wait_us: register_int_counter!(
                "drbd_controller_lock_wait_microseconds_total",
                "Time spent waiting for locks"
            )?,
            master_key: register_int_gauge!(
                "drbd_controller_master_key_present",
                "Whether a master key is installed"
            )?,
        })
    }

    fn refresh(&self, controller: &Controller) {
        let snapshot = controller.metrics().snapshot();

        advance(&self.requests, snapshot.requests);
        advance(&self.created, snapshot.volume_definitions_created);
        advance(&self.commits, snapshot.commits);
        for (kind, total) in [
            ("validation", snapshot.rejected_validation),
            ("exhausted", snapshot.rejected_exhausted),
            ("access", snapshot.rejected_access),
            ("crypto", snapshot.rejected_crypto),
            ("internal", snapshot.internal_faults),
        ] {
            advance(&self.rejected.with_label_values(&[kind]), total);
        }
        advance(
            &self.satellite_updates.with_label_values(&["ok"]),
            snapshot.satellite_updates_ok,
        );
        advance(
            &self.satellite_updates.with_label_values(&["failed"]),
            snapshot.satellite_updates_failed,
        );
        advance(&self.lock_wait_us, snapshot.lock_wait_us);
        self.master_key.set(i64::from(controller.crypto_ready()));
    }
}

async fn run_metrics_server(addr: &str, controller: Arc<Controller>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let collectors = Arc::new(
        PipelineCollectors::register()
            .map_err(|e| Error::Internal(format!("Failed to register metrics: {}", e)))?,
    );

    let make_svc = make_service_fn(move |_conn| {
        let collectors = collectors.clone();
        let controller = controller.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let collectors = collectors.clone();
                let controller = controller.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    if req.uri().path() != "/metrics" {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        *response.body_mut() = Body::from("not found");
                        return Ok::<_, std::convert::Infallible>(response);
                    }

                    collectors.refresh(&controller);
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            if let Ok(value) = encoder.format_type().parse() {
                                response.headers_mut().insert("Content-Type", value);
                            }
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            *response.body_mut() = Body::from(e.to_string());
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
