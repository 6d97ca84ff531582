//! Stack Auth token server
//!
//! Single-binary service that:
//! 1. Loads the signing key set (imported PEM or freshly generated)
//! 2. Issues, refreshes and revokes session tokens over HTTP
//! 3. Runs the CLI login handshake
//! 4. Rotates the signing key on a schedule

mod api;
mod config;
mod error;
mod metrics;
mod rotation;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use common::Secret;
use stack_auth::{
    CliLoginFlow, KeyStore, MemorySessionStore, SessionStore, TokenIssuer, system_clock,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, build_router};
use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting stack-auth-server");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if config.secret_server_key.is_none() {
        warn!("no secret server key configured, server-side endpoints are disabled");
    }
    info!(
        listen_addr = %config.server.listen_addr,
        api_url = %config.server.api_url,
        access_ttl_secs = config.tokens.access_ttl_secs,
        rotation_interval_secs = config.keys.rotation_interval_secs,
        "configuration loaded"
    );

    let clock = system_clock();
    let keys = Arc::new(KeyStore::new(config.grace_period(), clock.clone()));
    bootstrap_keys(&keys, config.signing_key_pem.as_ref()).await?;

    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(clock.clone()));
    let issuer = Arc::new(TokenIssuer::new(
        config.server.api_url.clone(),
        config.tokens.policy(),
        keys.clone(),
        sessions.clone(),
        clock.clone(),
    ));
    let login = Arc::new(CliLoginFlow::new(
        issuer.clone(),
        clock.clone(),
        config.login_expiry(),
    ));

    let cancel = CancellationToken::new();
    let rotation_handle =
        rotation::spawn_rotation_task(keys.clone(), config.rotation_interval(), cancel.clone());

    let app_state = AppState {
        api_url: config.server.api_url.clone(),
        keys,
        sessions,
        issuer,
        login,
        clock,
        server_key: config.secret_server_key.clone(),
        confirm_url: config.confirm_url(),
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    cancel.cancel();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Err(e) = rotation_handle.await {
        error!(error = %e, "rotation task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

/// Install the first signing key: the configured PEM if there is one,
/// otherwise a freshly generated key.
async fn bootstrap_keys(keys: &KeyStore, pem: Option<&Secret<String>>) -> Result<()> {
    let key = match pem {
        Some(pem) => keys
            .import_pem(pem.expose())
            .await
            .context("failed to import configured signing key")?,
        None => keys
            .rotate()
            .await
            .context("failed to generate initial signing key")?,
    };
    info!(kid = %key.kid(), imported = pem.is_some(), "signing key installed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
