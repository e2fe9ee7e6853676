use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use streamspace::agent::{AgentConfig, runner};
use streamspace::platform::{DockerDriver, KubernetesDriver, PlatformDriver};
use streamspace::protocol::Platform;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("STREAMSPACE_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::parse();

    // The Kubernetes client backs both the K8s driver and the HA lease.
    let kube_client = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "no kubernetes cluster reachable");
            None
        }
    };

    let driver: Arc<dyn PlatformDriver> = match config.platform {
        Platform::Kubernetes => {
            let client = kube_client
                .clone()
                .ok_or_else(|| anyhow::anyhow!("kubernetes platform requires a cluster"))?;
            Arc::new(KubernetesDriver::new(client, config.namespace.clone()))
        }
        Platform::Docker => Arc::new(
            DockerDriver::connect(config.docker_host.clone())
                .map_err(|e| anyhow::anyhow!("docker connection failed: {e}"))?,
        ),
    };

    driver
        .healthcheck()
        .await
        .map_err(|e| anyhow::anyhow!("platform healthcheck failed: {e}"))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
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
    });

    tracing::info!(
        agent_id = %config.agent_id,
        platform = config.platform.as_str(),
        ha = config.ha_enabled,
        "starting streamspace agent"
    );

    runner::run(config, driver, kube_client, shutdown_rx).await?;

    tracing::info!("agent stopped");
    Ok(())
}
