//! Tibber Live Proxy Binary
//!
//! Starts the live power telemetry proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tibber-live-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `TIBBER_API_TOKEN`: Seeded into the credentials table on startup
//! - `TIBBER_API_URL` / `TIBBER_WS_URL`: Provider endpoints
//! - `TIBBER_USER_AGENT`: User-Agent sent on every request
//! - `DATABASE_PATH`: SQLite file (default: tibber-live.db)
//! - `PROXY_HTTP_PORT`: Health, metrics and SSE port (default: 8080)
//! - `PROXY_CREDENTIAL_POLL_SECS`: Credential table poll interval (default: 5)
//! - `PROXY_RETENTION_HOURS`: Measurement retention (default: 24)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: tibber-live-proxy)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tibber_live_proxy::infrastructure::store::run_retention;
use tibber_live_proxy::infrastructure::telemetry;
use tibber_live_proxy::{
    BroadcastConfig, BroadcastHub, CredentialWatcher, HttpServer, HttpServerState,
    LiveSessionConfig, ProxyConfig, SessionSupervisor, SqliteStore, SupervisorConfig,
    TelemetryPipeline, TibberApiClient, TibberLiveFeed, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the retention task prunes old measurements.
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Buffered credential changes between the watcher and the supervisor.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Tibber Live Proxy");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Credential table and measurement history
    let store = SqliteStore::open(&config.store.database_path)?;
    if let Some(token) = config.tibber.api_token.as_deref() {
        let credential = store.insert_credential(token).await?;
        tracing::info!(credential_id = %credential.id(), "Seeded credential from environment");
    }

    // Fan-out to live-data subscribers
    let broadcast_hub = Arc::new(BroadcastHub::new(BroadcastConfig::from(
        config.broadcast.clone(),
    )));

    // Provider adapters
    let directory = Arc::new(TibberApiClient::new(
        &config.tibber.api_url,
        &config.tibber.user_agent,
        config.session.http_timeout,
    )?);
    let feed = Arc::new(TibberLiveFeed::new(LiveSessionConfig::from_settings(
        &config.tibber.ws_url,
        &config.tibber.user_agent,
        &config.session,
    )));

    let pipeline = Arc::new(TelemetryPipeline::new(
        Arc::clone(&broadcast_hub),
        Arc::new(store.clone()),
    ));

    let supervisor = SessionSupervisor::new(
        Arc::new(store.clone()),
        directory,
        feed,
        Arc::clone(&broadcast_hub),
        pipeline,
        SupervisorConfig::from_settings(&config.session, &config.supervisor),
        shutdown_token.clone(),
    );

    // Take the credential snapshot before the supervisor reads the table so
    // nothing inserted in between is missed.
    let mut watcher =
        CredentialWatcher::new(store.clone(), config.supervisor.credential_poll_interval);
    watcher.prime().await?;
    let (change_tx, change_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);

    // Spawn credential watcher
    let watcher_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        watcher.run(change_tx, watcher_shutdown).await;
    });

    // Spawn supervisor
    let supervisor_task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor.run(change_rx).await;
        })
    };

    // Spawn retention
    tokio::spawn(run_retention(
        store.clone(),
        config.store.retention,
        RETENTION_INTERVAL,
        shutdown_token.clone(),
    ));

    // Spawn HTTP server
    let http_state = Arc::new(HttpServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        supervisor,
        Arc::clone(&broadcast_hub),
    ));
    let http_server = HttpServer::new(
        config.server.http_port,
        http_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Live proxy ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor_task)
        .await
        .is_err()
    {
        tracing::warn!("Sessions did not stop before the shutdown timeout");
    }

    tracing::info!("Live proxy stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        database = %config.store.database_path.display(),
        seeded_token = config.tibber.api_token.is_some(),
        subscriber_capacity = config.broadcast.subscriber_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        api_url = %config.tibber.api_url,
        ws_url = %config.tibber.ws_url,
        user_agent = %config.tibber.user_agent,
        "Provider endpoints"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
