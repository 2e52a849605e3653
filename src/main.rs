use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use syncbridge::auth::tokens::spawn_rotation_schedule;
use syncbridge::auth::{AdminToken, TokenAuthority};
use syncbridge::config::Config;
use syncbridge::logging::{self, LogConfig};
use syncbridge::server::admin_auth::AdminGate;
use syncbridge::server::cors::CorsConfig;
use syncbridge::server::{create_router, AppState, MiddlewareConfig, WsState};
use syncbridge::store::StateStore;
use syncbridge::{hub, server};

/// Drain window after a shutdown signal before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    // Fatal at boot: missing/short secrets, unreachable backend.
    let config = Config::from_env()?;
    let store = StateStore::connect(config.store.clone()).await?;

    let authority = Arc::new(TokenAuthority::new(config.keys.clone()));
    let hub = hub::spawn();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let rotation_task = spawn_rotation_schedule(
        authority.clone(),
        config.rotation_interval,
        shutdown_rx.clone(),
    );

    let app_state = AppState {
        store: store.clone(),
        hub: hub.clone(),
        authority: authority.clone(),
        start_time: Instant::now(),
    };
    let ws_state = WsState {
        hub: hub.clone(),
        store: store.clone(),
        authority: authority.clone(),
        allowed_origins: Arc::new(config.allowed_origins.clone()),
    };
    let admin_gate = AdminGate::new(
        authority.clone(),
        config.admin_api_token.as_deref().map(AdminToken::new),
    );

    let middleware_config = MiddlewareConfig {
        cors: CorsConfig::with_origins(config.allowed_origins.clone()),
        csrf: server::csrf::CsrfConfig {
            secure_cookie: config.env.is_production(),
            enabled: true,
        },
        ..MiddlewareConfig::default()
    };

    let router = create_router(app_state, ws_state, admin_gate, middleware_config);

    info!("syncbridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server_addr);

    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_trigger(shutdown_tx));

    let mut grace_rx = shutdown_rx.clone();
    tokio::select! {
        result = async move { serve.await } => result?,
        _ = async {
            // Wait for the signal, then bound the drain.
            while !*grace_rx.borrow() {
                if grace_rx.changed().await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("shutdown grace window elapsed, forcing exit");
        }
    }

    rotation_task.abort();
    info!("Server exited");
    Ok(())
}

/// Initialize logging based on the ENV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("ENV").map(|v| v == "development").unwrap_or(false) {
        LogConfig::development()
    } else {
        LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

/// Resolve on shutdown signal, notifying background tasks first.
async fn shutdown_trigger(tx: tokio::sync::watch::Sender<bool>) {
    let reason = await_shutdown_signal().await;
    info!("Shutdown signal received ({})", reason);
    let _ = tx.send(true);
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for
/// logging.
#[cfg(unix)]
async fn await_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            let _ = tokio::signal::ctrl_c().await;
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
