use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use streamspace::config::Config;
use streamspace::dispatch::{CommandDispatcher, CommandStore};
use streamspace::hub::AgentHub;
use streamspace::store::AppState;
use streamspace::{api, hub, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("STREAMSPACE_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let config = Arc::new(Config::load());

    let pool = store::pool::connect(&config.database_url).await?;
    let valkey = store::valkey::connect(&config.valkey_url).await?;

    let hub = Arc::new(AgentHub::new(
        pool.clone(),
        valkey.clone(),
        config.pod_id.clone(),
    ));
    let commands = CommandStore::new(pool.clone());

    let state = AppState {
        pool,
        valkey,
        hub: Arc::clone(&hub),
        commands: commands.clone(),
        config: Arc::clone(&config),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());

    // Background tasks: cross-pod routing pump, stale sweep, dispatcher.
    tokio::spawn(Arc::clone(&hub).run_subscription_pump(shutdown_rx.clone()));
    tokio::spawn(hub::sweep::run(state.clone(), shutdown_rx.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(
        commands,
        Arc::clone(&hub),
        Arc::clone(&config),
    ));
    tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let app = api::router()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.listen.parse()?;
    tracing::info!(%addr, pod_id = %config.pod_id, "starting streamspace control plane");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;

    tracing::info!("control plane stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<()>) {
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
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}
