//! Composition root
//!
//! Reads configuration, wires the collaborator implementations into the
//! session core, and serves the HTTP/WebSocket edge until SIGTERM/ctrl-c,
//! then drains the registry.
//!
//! Process-wide state exists only here, as values plumbed through
//! construction; no module carries import-time side effects.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oxideterm_server::activity::{HttpActivityLog, NoopActivityLog, SharedActivityLog};
use oxideterm_server::auth::StaticVerifier;
use oxideterm_server::config::ServerConfig;
use oxideterm_server::opk::manager::FixedOpkBinary;
use oxideterm_server::opk::token::memory::MemoryOpkTokenStore;
use oxideterm_server::opk::OpkManager;
use oxideterm_server::session::{CoreDeps, SessionRegistry};
use oxideterm_server::ssh::HostKeyStore;
use oxideterm_server::store::memory::{MemoryStore, UnlockedKeyring};
use oxideterm_server::web::{build_router, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,oxideterm_server=debug")),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        data_dir = %config.data_dir.display(),
        listen = %config.listen_addr,
        origin = %config.public_origin,
        "Starting oxideterm-server"
    );

    let activity: SharedActivityLog = match &config.activity_log_url {
        Some(url) => Arc::new(HttpActivityLog::new(
            url.clone(),
            config.internal_auth_token.clone(),
        )),
        None => Arc::new(NoopActivityLog),
    };

    let tokens = Arc::new(MemoryOpkTokenStore::new());
    let opk_binary = std::env::var("OPKSSH_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("opkssh"));
    let opk = Arc::new(OpkManager::new(
        Arc::new(FixedOpkBinary(opk_binary)),
        tokens.clone(),
        config.opk_dir(),
        config.public_origin.clone(),
    ));

    // The credential store, keyring, token store and JWT verifier are
    // external services in a full deployment; the in-memory variants wire
    // the core for standalone operation and tests.
    let deps = Arc::new(CoreDeps {
        hostkeys: Arc::new(HostKeyStore::new(config.hostkeys_dir())),
        verifier: Arc::new(StaticVerifier),
        credentials: Arc::new(MemoryStore::new()),
        keyring: Arc::new(UnlockedKeyring),
        tokens,
        opk: opk.clone(),
        activity,
        config: config.clone(),
    });

    let registry = SessionRegistry::new(deps.clone());
    let app = build_router(AppState {
        deps,
        registry: registry.clone(),
    });

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Cannot bind {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };

    info!("Listening on {}", config.listen_addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!("Server error: {}", e);
    }

    info!("Shutting down: draining sessions");
    registry.shutdown().await;
    opk.shutdown().await;
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
