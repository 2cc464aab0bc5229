use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use namecache::cache::{StoreConfig, TtlKvStore};
use namecache::config::{self, Config};
use namecache::metrics::MetricsRegistry;
use namecache::registry::gateway::{
    build_http_client, GatewayProcessFactory, GatewayRegistryClient,
};
use namecache::resolver::{EvaluationScheduler, ResolutionEngine};
use namecache::{http, AppState};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "namecache", about = "Name resolution cache")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/namecache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Store and resolver setup
// ---------------------------------------------------------------------------

fn open_store(config: &Config) -> Result<TtlKvStore> {
    let store_config = StoreConfig::new(&config.cache.path, config.store_ttl())
        .with_commit_delay(std::time::Duration::from_millis(config.cache.commit_delay_ms));
    let store = TtlKvStore::open(store_config)
        .with_context(|| format!("failed to open cache store at {}", config.cache.path))?;

    tracing::info!(
        path = %config.cache.path,
        ttl_secs = store.ttl().map(|ttl| ttl.as_secs()),
        "cache store opened"
    );
    Ok(store)
}

fn build_scheduler(
    config: &Config,
    store: TtlKvStore,
    metrics: MetricsRegistry,
) -> Result<Arc<EvaluationScheduler>> {
    let http_client = build_http_client(&config.registry)?;
    let registry = Arc::new(GatewayRegistryClient::new(
        http_client.clone(),
        &config.registry,
    ));
    let processes = Arc::new(GatewayProcessFactory::new(http_client, &config.registry));

    let engine = ResolutionEngine::new(
        registry,
        processes,
        Arc::new(store),
        config.evaluation.max_concurrency,
        config.evaluation.interval_secs,
        metrics.clone(),
    );
    tracing::info!(
        gateway = %config.registry.gateway_url,
        process_id = %config.registry.process_id,
        max_concurrency = config.evaluation.max_concurrency,
        "resolution engine initialised"
    );

    Ok(Arc::new(EvaluationScheduler::new(
        Arc::new(engine),
        config.evaluation.interval(),
        metrics,
    )))
}

fn admin_token(config: &Config) -> Option<String> {
    let token = std::env::var(&config.server.admin_token_env)
        .ok()
        .filter(|token| !token.is_empty());
    if token.is_none() {
        tracing::warn!(
            env = %config.server.admin_token_env,
            "admin token not set, admin endpoints will reject all requests"
        );
    }
    token
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid listen address")?;
    let app = http::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting namecache");

    // ---- Store, metrics, resolver ----
    let store = open_store(&config)?;
    let metrics = MetricsRegistry::new();
    let scheduler = build_scheduler(&config, store.clone(), metrics.clone())?;

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        store: store.clone(),
        scheduler: Arc::clone(&scheduler),
        metrics,
        admin_token: admin_token(&config),
        started_at: Instant::now(),
    };

    // ---- Spawn services ----
    let shutdown = CancellationToken::new();

    let http_handle = tokio::spawn({
        let s = state.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_http_server(s, shutdown).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let scheduler_handle = if config.evaluation.enabled {
        Some(tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone())))
    } else {
        tracing::info!("periodic evaluation disabled");
        None
    };

    // ---- Await shutdown ----
    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = http_handle.await {
        tracing::error!(error = %e, "HTTP server task panicked");
    }
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "evaluation scheduler task panicked");
        }
    }

    store.flush().await.context("failed to flush cache store")?;

    tracing::info!("namecache shut down cleanly");
    Ok(())
}
