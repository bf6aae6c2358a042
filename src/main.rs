//! Storage Lifecycle
//!
//! Standalone control plane process: loads the YAML configuration, checks
//! every transition table, validates the configured backends, and serves
//! health and metrics endpoints while the engines run.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_lifecycle::config::AgentMode;
use storage_lifecycle::controlplane::{HttpHostAgent, StaticHostAgent};
use storage_lifecycle::domain::ports::HostAgentRef;
use storage_lifecycle::fsm::MetricsListener;
use storage_lifecycle::{
    BackendRegistry, ControlPlaneConfig, Error, LifecycleEngines, LifecycleTables, MemoryDatabase,
    ReconciliationManager, ResourceAccounting, Result, StaticInventory, VolumeOrchestrator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Lifecycle - resource lifecycle engine for a storage control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML); defaults apply when omitted
    #[arg(long, env = "LIFECYCLE_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Check configuration and transition tables, then exit
    #[arg(long)]
    validate_only: bool,

    /// List unmanaged objects on every pool at startup
    #[arg(long, env = "DISCOVER_ON_START")]
    discover_on_start: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Storage Lifecycle engine");
    info!("  Version: {}", storage_lifecycle::VERSION);

    let config = match &args.config {
        Some(path) => ControlPlaneConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            warn!("No configuration file given, running with defaults");
            ControlPlaneConfig::default()
        }
    };

    let tables = LifecycleTables::build().context("building transition tables")?;

    if args.validate_only {
        info!(
            backends = config.backends.len(),
            pools = config.pools.len(),
            hosts = config.hosts.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    // Backends
    let backends = Arc::new(BackendRegistry::from_configs(&config.backends)?);
    backends
        .initialize(config.backend_init_timeout())
        .await
        .context("validating storage backends")?;
    info!(backends = ?backends.names(), "Storage backends ready");

    // Persistence and accounting
    let db = Arc::new(MemoryDatabase::new());
    for (resource, limit) in &config.limits.defaults {
        db.set_default_limit(*resource, *limit);
    }
    for (account, limits) in &config.limits.accounts {
        for (resource, limit) in limits {
            db.set_limit(account, *resource, *limit).await?;
        }
    }
    for offering in &config.offerings {
        db.add_offering(offering.clone());
    }

    // Engines
    let metrics = MetricsListener::new(prometheus::default_registry())?;
    let engines = LifecycleEngines::new(&tables, db.clone(), Some(metrics));
    let inventory = Arc::new(StaticInventory::new(config.pools.clone(), config.hosts.clone()));

    let orchestrator = VolumeOrchestrator::new(
        config.orchestrator_config(),
        engines.clone(),
        backends.clone(),
        inventory.clone(),
        db.clone(),
        db.clone(),
    );

    let agent: HostAgentRef = match config.agent.mode {
        AgentMode::Http => Arc::new(HttpHostAgent::new(config.agent.port, config.agent.timeout())?),
        AgentMode::Static => Arc::new(StaticHostAgent::new()),
    };
    let reconciler = ReconciliationManager::new(
        engines.volumes.clone(),
        inventory.clone(),
        inventory.clone(),
        agent,
        db.clone(),
        db.clone(),
        config.agent.timeout(),
    );

    let stuck = orchestrator.in_progress_volumes().await?;
    if !stuck.is_empty() {
        warn!(count = stuck.len(), "Volumes left in progress by a previous run");
    }

    if args.discover_on_start {
        for pool in &config.pools {
            match reconciler.list_unmanaged(&pool.id).await {
                Ok(found) => info!(pool_id = %pool.id, unmanaged = found.len(), "Startup discovery"),
                Err(e) => warn!(pool_id = %pool.id, error = %e, "Startup discovery failed"),
            }
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
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!(pools = config.pools.len(), hosts = config.hosts.len(), "Control plane ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    for name in backends.names() {
        if let Ok(adapter) = backends.get(&name) {
            if let Err(e) = adapter.disconnect().await {
                warn!(backend = %name, error = %e, "Backend disconnect failed");
            }
        }
    }

    info!("Shutdown complete");
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
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

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
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
