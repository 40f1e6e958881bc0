//! EBS Orchestrator
//!
//! Runs the job dispatch pipeline against the configured SAN arrays and
//! RBD clusters, with health and metrics endpoints alongside.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │   queue ──► worker pool ──► router ──► orchestrator ──► drivers      │
//! │                                              │                       │
//! │                           capacity monitor ──┘                       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │   /healthz /readyz (health addr)        /metrics (metrics addr)      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use hyper::{Body, Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ebs_orchestrator::{
    BackendFactory, CapacityMonitor, DispatchMetrics, DriverRegistry, FileQueue, HttpNotifier, JobQueue,
    MemoryQueue, MemoryStore, Orchestrator, Persistence, QosEngine, QueueBackend, Router, ServiceConfig, SpecCache,
    WorkerPool,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// EBS Orchestrator - block volume jobs across SAN arrays and RBD clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "EBS_CONFIG")]
    config: Option<PathBuf>,

    /// Node identifier
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Concurrent job workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Queue key jobs are read from
    #[arg(long, env = "QUEUE_KEY")]
    queue_key: Option<String>,

    /// Use a durable queue rooted at this directory
    #[arg(long, env = "QUEUE_DIR")]
    queue_dir: Option<PathBuf>,

    /// Per-job timeout in seconds
    #[arg(long, env = "JOB_TIMEOUT")]
    job_timeout_secs: Option<u64>,

    /// Capacity sampling interval in seconds
    #[arg(long, env = "MONITOR_INTERVAL")]
    monitor_interval_secs: Option<u64>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Overlay the given arguments on the file configuration
    fn apply(self, config: &mut ServiceConfig) {
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(key) = self.queue_key {
            config.pool.queue_key = key;
        }
        if let Some(dir) = self.queue_dir {
            config.queue = QueueBackend::File { dir };
        }
        if self.job_timeout_secs.is_some() {
            config.pool.job_timeout_secs = self.job_timeout_secs;
        }
        if let Some(secs) = self.monitor_interval_secs {
            config.monitor_interval_secs = secs;
        }
        if let Some(addr) = self.health_addr {
            config.server.health_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.server.metrics_addr = addr;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.log_json |= self.log_json;
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServiceConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate()?;

    init_logging(&config.log_level, config.log_json)?;

    info!("Starting EBS Orchestrator");
    info!("  Version: {}", ebs_orchestrator::VERSION);
    info!("  Node: {}", config.node_id);
    info!("  Workers: {}", config.pool.workers);
    info!("  Queue: {:?} key {}", config.queue, config.pool.queue_key);

    // Reference data
    let memory = MemoryStore::new();
    config.seed(&memory).await?;
    let store: Arc<dyn Persistence> = Arc::new(memory);
    let specs = Arc::new(SpecCache::new());
    let loaded = specs.refresh(store.as_ref()).await?;
    info!("Loaded {} disk specifications", loaded);

    // Orchestration
    let qos = Arc::new(QosEngine::new(store.clone(), specs));
    let factory = Arc::new(BackendFactory::new(config.backends.clone(), store.clone(), qos));
    let registry = Arc::new(DriverRegistry::new(factory));
    let notifier = Arc::new(HttpNotifier::new(config.notifier.clone())?);
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        registry,
        store,
        notifier,
    ));

    // Dispatch
    let queue: Arc<dyn JobQueue> = match &config.queue {
        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
        QueueBackend::File { dir } => Arc::new(
            FileQueue::open(dir)
                .await
                .with_context(|| format!("opening queue at {}", dir.display()))?,
        ),
    };
    let metrics = DispatchMetrics::new()?;
    let pool = WorkerPool::new(config.pool.clone(), Router::new(orchestrator.clone()), queue, metrics.clone());

    let cancel = CancellationToken::new();
    let pool_handle = pool.spawn(cancel.clone());
    let monitor_handle = CapacityMonitor::new(
        orchestrator.clone(),
        Duration::from_secs(config.monitor_interval_secs),
    )
    .spawn(cancel.clone());

    // Start health server
    let health_addr = config.server.health_addr.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cancel).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.server.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown requested, draining in-flight jobs");
    cancel.cancel();

    if let Err(e) = pool_handle.await {
        error!("Worker pool ended abnormally: {}", e);
    }
    if let Err(e) = monitor_handle.await {
        error!("Capacity monitor ended abnormally: {}", e);
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let shutdown = shutdown.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let draining = shutdown.is_cancelled();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if draining => respond(StatusCode::SERVICE_UNAVAILABLE, "draining"),
                        "/readyz" => respond(StatusCode::OK, "ok"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)?.serve(make_svc).await?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: DispatchMetrics) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)?.serve(make_svc).await?;

    Ok(())
}
