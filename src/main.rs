//! docgate - Quota-Aware Caching & Sync Governor
//!
//! Runs a governor in front of a document store and exposes its state over
//! HTTP for operators.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             docgate                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  /healthz  /readyz  /stats  /metrics   ◀── hyper http1 server    │
//! │                       │                                          │
//! │                  SmartStore  ──▶  memory | http backend          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docgate::adapters::{HttpBackendConfig, HttpDocumentBackend, InMemoryDocumentBackend};
use docgate::{DocumentBackend, GovernorConfig, SmartStore};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// In-process store, for local runs and demos
    Memory,
    /// JSON/HTTP document store gateway
    Http,
}

/// docgate - quota-aware caching and sync governor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, env = "DOCGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Document store backend
    #[arg(long, env = "DOCGATE_BACKEND", value_enum, default_value = "memory")]
    backend: BackendKind,

    /// Base URL of the HTTP backend
    #[arg(long, env = "DOCGATE_BACKEND_URL", default_value = "http://localhost:8700")]
    backend_url: String,

    /// Bearer token for the HTTP backend
    #[arg(long, env = "DOCGATE_API_TOKEN")]
    api_token: Option<String>,

    /// Stats, metrics and health server bind address
    #[arg(long, env = "DOCGATE_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

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
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting docgate");

    let config = match &args.config {
        Some(path) => GovernorConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GovernorConfig::default(),
    };
    info!(
        "  Daily reads/writes/deletes: {}/{}/{}",
        config.daily_read_limit, config.daily_write_limit, config.daily_delete_limit
    );
    info!("  Safety margin: {}", config.safety_margin);
    info!("  Max active listeners: {}", config.max_active_listeners);

    let backend = build_backend(&args, &config)?;
    info!("  Backend: {}", backend.name());

    let store = SmartStore::new(config, backend).context("building governor")?;
    store.start();

    let addr: SocketAddr = args
        .addr
        .parse()
        .with_context(|| format!("invalid server address {}", args.addr))?;
    let server_store = store.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_server(addr, server_store).await {
            error!("HTTP server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Received Ctrl-C");

    store.shutdown().await;
    server.abort();

    info!("docgate shutdown complete");
    Ok(())
}

fn build_backend(args: &Args, config: &GovernorConfig) -> anyhow::Result<Arc<dyn DocumentBackend>> {
    let backend: Arc<dyn DocumentBackend> = match args.backend {
        BackendKind::Memory => Arc::new(InMemoryDocumentBackend::with_max_batch_ops(
            config.max_batch_ops_per_commit,
        )),
        BackendKind::Http => Arc::new(
            HttpDocumentBackend::new(HttpBackendConfig {
                base_url: args.backend_url.trim_end_matches('/').to_string(),
                api_token: args.api_token.clone(),
                request_timeout: config.backend_timeout().max(Duration::from_secs(1)),
                max_batch_ops: config.max_batch_ops_per_commit,
            })
            .context("creating HTTP backend")?,
        ),
    };
    Ok(backend)
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
// HTTP Server
// =============================================================================

fn respond(
    status: StatusCode,
    content_type: HeaderValue,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, HeaderValue::from_static("text/plain"), body)
}

async fn handle(
    store: SmartStore,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => {
            if store.is_shutting_down() {
                text(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
            } else {
                text(StatusCode::OK, "ok")
            }
        }
        "/readyz" => {
            let report = store.health();
            let status = if report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&report) {
                Ok(body) => respond(status, HeaderValue::from_static("application/json"), body),
                Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "encoding error"),
            }
        }
        "/stats" => match serde_json::to_vec(&store.stats()) {
            Ok(body) => respond(StatusCode::OK, HeaderValue::from_static("application/json"), body),
            Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "encoding error"),
        },
        "/metrics" => match store.metrics_text() {
            Ok((content_type, body)) => {
                let content_type = HeaderValue::from_str(&content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
                respond(StatusCode::OK, content_type, body)
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "metrics error")
            }
        },
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_server(addr: SocketAddr, store: SmartStore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding HTTP server to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("HTTP server accept error")?;

        let io = TokioIo::new(stream);
        let store = store.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(store.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error: {}", e);
            }
        });
    }
}
