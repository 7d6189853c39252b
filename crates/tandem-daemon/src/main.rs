//! tandem-daemon entry point.
//!
//! This file is intentionally thin: it parses flags, loads config, sets up
//! tracing (stdout plus a JSONL file per broker session), opens the store,
//! wires the optional reviewer pool, and starts the HTTP server. Route
//! handlers live in `routes.rs`/`rpc.rs`; shared state lives in `state.rs`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use tandem_broker::BrokerCtx;
use tandem_config::BrokerConfig;
use tandem_daemon::{routes, state};
use tandem_pool::ReviewerPool;

#[derive(Parser)]
#[command(name = "tandem-daemon")]
#[command(about = "Local review broker for proposer/reviewer agent pairs", long_about = None)]
struct Cli {
    /// Bind host. Loopback only by design; overriding this does not add auth.
    #[arg(long)]
    host: Option<String>,

    /// Bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Project directory (holds the .tandem planning directory).
    #[arg(long, default_value = ".")]
    project: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    let project_dir = cli
        .project
        .canonicalize()
        .with_context(|| format!("project directory {:?}", cli.project))?;

    let mut cfg = BrokerConfig::load(&project_dir)?;
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let session_token = tandem_pool::new_session_token();
    init_tracing(&cfg.log_dir(), &session_token)?;
    info!(session = %session_token, project = ?project_dir, "tandem-daemon starting");

    // Store: schema failures here are fatal by design.
    let pool = tandem_db::connect(&cfg.db_path()).await?;
    tandem_db::ensure_schema(&pool).await?;

    // Repository discovery; diff validation degrades to a clean error when
    // the project is not a git checkout.
    let repo_root = match tandem_diff::discover_repo_root(&project_dir).await {
        Ok(root) => {
            info!(root = ?root, "repository root discovered");
            Some(root)
        }
        Err(e) => {
            warn!(error = %e, "repository discovery failed; diff validation disabled");
            None
        }
    };

    let ctx = BrokerCtx::new(pool, repo_root);
    let broker_url = format!("http://{}:{}", cfg.host, cfg.port);

    let pool_mgr = match cfg.pool.clone() {
        Some(pool_cfg) => {
            let template = tandem_pool::load_prompt_template()?;
            let mgr = ReviewerPool::new(
                Arc::clone(&ctx),
                pool_cfg,
                session_token.clone(),
                broker_url.clone(),
                template,
            )?;
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            ctx.register_pool_signals(tx);
            mgr.startup_recovery().await?;
            mgr.start(rx);
            info!("reviewer pool enabled");
            Some(mgr)
        }
        None => {
            info!("no pool section configured; reviewer pool disabled");
            None
        }
    };

    let shared = state::AppState::new(Arc::clone(&ctx), pool_mgr.clone());
    state::spawn_dashboard_feed(Arc::clone(&shared));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.host, cfg.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("tandem-daemon listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    // Lifespan teardown: drain reviewers and terminate survivors within a
    // bounded grace period.
    if let Some(mgr) = pool_mgr {
        info!("draining reviewer pool");
        mgr.shutdown().await;
    }
    info!("tandem-daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Tracing: human-readable stdout plus one JSONL file per broker session in
/// the platform data dir.
fn init_tracing(log_dir: &Path, session_token: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    std::fs::create_dir_all(log_dir).with_context(|| format!("create log dir {:?}", log_dir))?;
    let log_path = log_dir.join(format!("broker-{session_token}.jsonl"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open broker log {:?}", log_path))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
        .init();
    Ok(())
}

/// CORS: allow only localhost origins (the dashboard is same-origin anyway).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:8321",
        "http://127.0.0.1:8321",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
