use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

mod app;
mod auth;
mod http;

use taskwheel_core::config::{resolve_listen_host, TaskwheelConfig};
use taskwheel_engine::{AccountDirectory, Dispatcher, Runner};
use taskwheel_store::TaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "taskwheel_gateway=info,taskwheel_engine=info,taskwheel_store=info,tower_http=warn"
                    .into()
            }),
        )
        .init();

    // Config: explicit path via TASKWHEEL_CONFIG, else ./taskwheel.toml, with
    // TASKWHEEL_* env overrides on top.
    let config_path = std::env::var("TASKWHEEL_CONFIG").ok();
    let config = TaskwheelConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        TaskwheelConfig::default()
    });

    info!(path = %config.store.path, "opening task store");
    let store = Arc::new(TaskStore::open(&config.store.path)?);

    let accounts = AccountDirectory::new();

    let auth_path = config.auth_path.clone().unwrap_or_else(|| "auth.json".to_string());
    let auth = auth::load_auth_config(&auth_path).map_err(anyhow::Error::msg)?;
    if let Some(ref auth) = auth {
        info!(user = %auth.username, realm = %auth.realm, "basic auth enabled");
    }

    let (runner_handle, runner) =
        Runner::new(Arc::clone(&store), accounts.clone(), config.runner.clone());
    tokio::spawn(runner.run());

    // The dispatcher emits boot-event fires before its first tick.
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        runner_handle.clone(),
        accounts.clone(),
        config.runner.clone(),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));

    let host = resolve_listen_host(&config.server.bind, config.server.prefer_ipv6)?;
    let port = config.server.port;
    let state = Arc::new(app::AppState {
        store,
        runner: runner_handle,
        accounts,
        auth,
        config,
    });
    let router = app::build_router(Arc::clone(&state));

    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!("taskwheel listening on {}:{}", host, port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Serve returned: run the engine shutdown sequence (shutdown-event fires,
    // drain within the grace period, force-kill stragglers).
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = dispatcher_task.await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
