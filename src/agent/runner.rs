use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::platform::PlatformDriver;
use crate::protocol::{self, AgentFrame, ControlFrame};

use super::config::AgentConfig;
use super::error::AgentError;
use super::leader::LeaderElection;
use super::lifecycle::SessionLifecycleHandler;

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Outbound frame buffer between the lifecycle handler and the socket.
const OUTBOUND_CAPACITY: usize = 64;

/// Agent main loop: hold leadership (when HA is on), keep one WebSocket
/// to the control plane, reconnect with backoff, and feed inbound
/// commands to the lifecycle handler.
pub async fn run(
    config: AgentConfig,
    driver: Arc<dyn PlatformDriver>,
    kube_client: Option<kube::Client>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), AgentError> {
    // HA without a coordination backend must refuse to start: replicas
    // connecting unguarded kick each other off forever.
    let election = if config.ha_enabled {
        let client = kube_client.ok_or_else(|| {
            AgentError::NoCoordinationBackend(
                "ha.enabled requires a reachable Kubernetes cluster for the lease".into(),
            )
        })?;
        Some(Arc::new(LeaderElection::new(
            client,
            &config.namespace,
            &config.agent_id,
            config.replica_name(),
        )))
    } else {
        None
    };

    let handler = Arc::new(SessionLifecycleHandler::new(
        driver,
        config.provision_deadline(),
    ));

    loop {
        if shutdown.has_changed().unwrap_or(true) {
            return Ok(());
        }

        // Standby until this replica leads; single-instance mode connects
        // unconditionally.
        let (lost_tx, lost_rx) = watch::channel(false);
        // Keeps the sender alive when there is no renewal task, so the
        // receiver never reports a closed channel.
        let mut _lost_keepalive = None;
        if let Some(election) = &election {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                result = election.acquire() => result?,
            }
            let election = Arc::clone(election);
            let renewal_shutdown = shutdown.clone();
            tokio::spawn(async move {
                election.run_renewal(lost_tx, renewal_shutdown).await;
            });
        } else {
            _lost_keepalive = Some(lost_tx);
        }

        let mut backoff = BACKOFF_MIN;
        loop {
            match connect_and_serve(&config, &handler, lost_rx.clone(), shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(AgentError::LeadershipLost) => {
                    tracing::warn!("leadership lost, returning to standby");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, delay = ?backoff, "connection lost, reconnecting");
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
            if *lost_rx.borrow() {
                break;
            }
        }
    }
}

/// One connection lifetime: register, then pump frames both ways until
/// the socket drops, leadership lapses, or shutdown lands. Returns Ok
/// only on clean shutdown.
async fn connect_and_serve(
    config: &AgentConfig,
    handler: &Arc<SessionLifecycleHandler>,
    mut lost: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), AgentError> {
    let (stream, _) = connect_async(config.control_plane_url.as_str())
        .await
        .map_err(|e| AgentError::Connect(e.to_string()))?;
    let (mut ws_tx, mut ws_rx) = stream.split();

    let register = AgentFrame::Register {
        agent_id: config.agent_id.clone(),
        platform: config.platform,
        region: config.region.clone(),
        capacity: config.capacity(),
        api_key: config.api_key.clone(),
    };
    ws_tx
        .send(Message::Text(serde_json::to_string(&register)?.into()))
        .await
        .map_err(|e| AgentError::Connect(e.to_string()))?;

    tracing::info!(agent_id = %config.agent_id, url = %config.control_plane_url, "registered with control plane");

    let (out_tx, mut out_rx) = mpsc::channel::<AgentFrame>(OUTBOUND_CAPACITY);
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(protocol::HEARTBEAT_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = lost.changed() => {
                if *lost.borrow() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Err(AgentError::LeadershipLost);
                }
            }
            _ = heartbeat.tick() => {
                let frame = AgentFrame::Heartbeat {
                    agent_id: config.agent_id.clone(),
                    status: "online".into(),
                    active_sessions: handler.active_sessions().await,
                };
                let json = serde_json::to_string(&frame)?;
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return Err(AgentError::Disconnected);
                }
            }
            frame = out_rx.recv() => {
                // The handler side of the channel never closes before us.
                let Some(frame) = frame else { return Err(AgentError::Disconnected) };
                let json = serde_json::to_string(&frame)?;
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return Err(AgentError::Disconnected);
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(frame) => {
                                // Commands address independent sessions;
                                // run them concurrently.
                                let handler = Arc::clone(handler);
                                let out_tx = out_tx.clone();
                                tokio::spawn(async move {
                                    handler.handle(frame, &out_tx).await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(AgentError::Disconnected);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(AgentError::Connect(e.to_string()));
                    }
                }
            }
        }
    }
}
