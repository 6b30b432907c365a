//! tiercache daemon
//!
//! Runs a cache engine with health probes and a Prometheus endpoint.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        tiercache                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Health     │───▶│    Cache     │◀───│   Metrics    │       │
//! │  │   Server     │    │   Manager    │    │   Server     │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                    │
//! │                    local LRU ─▶ Redis                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::CacheManager;
use tiercache::config::CacheConfig;
use tiercache::monitoring::{HealthCheck, StatsExporter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - two-tier cache engine daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<String>,

    /// Redis URL for the remote tier (overrides remote.endpoint)
    #[arg(long, env = "TIERCACHE_REDIS_URL")]
    redis_url: Option<String>,

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

    /// Skip startup warmup even if enabled in config
    #[arg(long)]
    no_warmup: bool,
}

/// State shared by the HTTP servers
struct AppState {
    cache: Arc<CacheManager>,
    health: HealthCheck,
    exporter: StatsExporter,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => CacheConfig::default(),
    };
    if let Some(url) = &args.redis_url {
        config.remote.endpoint = Some(url.clone());
    }
    if args.no_warmup {
        config.warmup.enabled = false;
    }

    info!("Starting tiercache");
    info!(
        "  Remote tier: {}",
        config.remote.endpoint.as_deref().unwrap_or("in-process")
    );
    info!("  Key prefix: {}", config.remote.key_prefix);
    info!(
        "  Local bounds: {} entries / {} bytes",
        config.local.max_entries, config.local.max_bytes
    );
    info!("  Encryption: {}", config.encryption.enabled);

    let cache = Arc::new(
        CacheManager::connect(config)
            .await
            .context("connecting cache engine")?,
    );

    let state = Arc::new(AppState {
        cache: cache.clone(),
        health: HealthCheck::new(),
        exporter: StatsExporter::new()?,
    });

    // Start servers before warmup so liveness answers during a long warmup
    let health_state = state.clone();
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_state).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_state = state.clone();
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_state).await {
            error!("Metrics server error: {}", e);
        }
    });

    if let Some(report) = cache.run_startup_warmup().await {
        info!(
            executed = report.executed.len(),
            failed = report.failed.len(),
            entries = report.entries_loaded,
            "Startup warmup finished"
        );
        for (name, reason) in &report.failed {
            warn!(strategy = %name, "Warmup strategy failed: {}", reason);
        }
    }
    state.health.set_ready(true);
    info!("tiercache ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutting down");
    state.health.set_ready(false);
    state.health.set_live(false);
    if let Err(e) = cache.disconnect().await {
        warn!("Remote tier disconnect failed: {}", e);
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
    for directive in ["hyper=warn", "redis=info"] {
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
// HTTP helpers
// =============================================================================

type HttpResult = std::result::Result<Response<Full<Bytes>>, std::convert::Infallible>;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization failed: {e}"),
        ),
    }
}

fn not_found() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "text/plain", "not found")
}

async fn serve<H, Fut>(addr: &str, label: &'static str, handler: H) -> anyhow::Result<()>
where
    H: Fn(Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = HttpResult> + Send + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {label} server address"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {label} server"))?;

    info!("{} server listening on {}", label, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .with_context(|| format!("{label} server accept error"))?;

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("{} server connection error: {}", label, e);
            }
        });
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    serve(addr, "Health", move |req| {
        let state = state.clone();
        async move { Ok(health_handler(req, &state).await) }
    })
    .await
}

async fn health_handler(req: Request<hyper::body::Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz" | "/livez" => {
            let result = state.health.liveness_check();
            let status = if result.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &result)
        }
        "/readyz" => {
            let response = state.health.readiness_check(&state.cache).await;
            // Degraded still serves traffic from the local tier
            let status = if response.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &response)
        }
        _ => not_found(),
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    serve(addr, "Metrics", move |req| {
        let state = state.clone();
        async move { Ok(metrics_handler(req, &state).await) }
    })
    .await
}

async fn metrics_handler(req: Request<hyper::body::Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => {
            state.exporter.update(&state.cache.stats().await);
            match state.exporter.encode() {
                Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            }
        }
        "/stats" => json(StatusCode::OK, &state.cache.stats().await),
        _ => not_found(),
    }
}
