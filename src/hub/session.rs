use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::extract::ws;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::dispatch::DispatchError;
use crate::protocol::{self, AgentFrame, ControlFrame};
use crate::store::AppState;

/// Outbound frame queue depth per agent connection. `Send` calls beyond
/// this return backpressure to the dispatcher instead of buffering
/// unboundedly.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// How long the upgrade waits for the agent's `register` frame.
const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

/// One live WebSocket peer from one agent replica. Owned exclusively by
/// the control-plane process that accepted the upgrade; the hub holds the
/// only long-lived handle, and the session refers back to the hub by
/// `agent_id` + `connection_id` only.
pub struct AgentSession {
    pub agent_id: String,
    pub connection_id: Uuid,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    last_seen_unix: AtomicI64,
    frames_tx: mpsc::Sender<ControlFrame>,
    close_tx: watch::Sender<Option<String>>,
}

impl AgentSession {
    fn new(
        agent_id: String,
        remote_addr: String,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<ControlFrame>,
        watch::Receiver<Option<String>>,
    ) {
        let (frames_tx, frames_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        let session = Arc::new(Self {
            agent_id,
            connection_id: Uuid::new_v4(),
            remote_addr,
            connected_at: Utc::now(),
            last_seen_unix: AtomicI64::new(Utc::now().timestamp()),
            frames_tx,
            close_tx,
        });
        (session, frames_rx, close_rx)
    }

    /// Enqueue a frame for the write pump. Never blocks: a full queue is
    /// backpressure the dispatcher handles by retrying later.
    pub fn send(&self, frame: ControlFrame) -> Result<(), DispatchError> {
        self.frames_tx
            .try_send(frame)
            .map_err(|_| DispatchError::Backpressure)
    }

    /// Ask the pumps to shut the connection down.
    pub fn close(&self, reason: &str) {
        let _ = self.close_tx.send(Some(reason.to_owned()));
    }

    pub fn touch(&self) {
        self.last_seen_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_seen_unix.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen()).num_seconds() > protocol::STALE_AFTER_SECS as i64
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Drive one agent WebSocket from upgrade to disconnect: authenticate the
/// `register` frame, attach the session to the hub, then run the read and
/// write pumps until either side ends the connection.
pub async fn run_agent_connection(state: AppState, socket: ws::WebSocket, remote_addr: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first frame must be a valid register within the deadline.
    let (agent_id, platform, region, capacity, api_key) =
        match tokio::time::timeout(REGISTER_DEADLINE, ws_rx.next()).await {
            Ok(Some(Ok(ws::Message::Text(text)))) => {
                match serde_json::from_str::<AgentFrame>(&text) {
                    Ok(AgentFrame::Register {
                        agent_id,
                        platform,
                        region,
                        capacity,
                        api_key,
                    }) => (agent_id, platform, region, capacity, api_key),
                    Ok(_) => {
                        tracing::warn!(%remote_addr, "first frame was not register");
                        let _ = ws_tx.close().await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(%remote_addr, error = %e, "malformed register frame");
                        let _ = ws_tx.close().await;
                        return;
                    }
                }
            }
            _ => {
                tracing::warn!(%remote_addr, "agent did not register in time");
                let _ = ws_tx.close().await;
                return;
            }
        };

    if let Err(e) = super::auth::verify_agent_key(&state.pool, &agent_id, platform, &api_key).await
    {
        tracing::warn!(%agent_id, %remote_addr, error = %e, "agent authentication failed");
        let _ = ws_tx.close().await;
        return;
    }

    let (session, frames_rx, close_rx) = AgentSession::new(agent_id.clone(), remote_addr);
    let connection_id = session.connection_id;

    if let Err(e) = state
        .hub
        .register(Arc::clone(&session), &region, &capacity)
        .await
    {
        tracing::error!(%agent_id, error = %e, "hub registration failed");
        let _ = ws_tx.close().await;
        return;
    }

    tracing::info!(%agent_id, %connection_id, "agent connected");

    // Write pump: single owner of the socket sink. Serializes queued
    // frames and keeps the connection alive with pings.
    let write_agent_id = agent_id.clone();
    let mut write_close_rx = close_rx.clone();
    let write_pump = tokio::spawn(async move {
        let mut frames_rx = frames_rx;
        let mut ping = tokio::time::interval(Duration::from_secs(protocol::HEARTBEAT_INTERVAL_SECS));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = write_close_rx.changed() => {
                    if changed.is_ok() {
                        let reason = write_close_rx.borrow().clone().unwrap_or_default();
                        tracing::info!(agent_id = %write_agent_id, %reason, "closing agent connection");
                    }
                    let _ = ws_tx.close().await;
                    break;
                }
                frame = frames_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "outbound frame failed to serialize");
                            continue;
                        }
                    };
                    if ws_tx.send(ws::Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(ws::Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read pump: demultiplexes inbound frames. Malformed input is logged
    // and dropped, never fatal.
    let mut read_close_rx = close_rx;
    loop {
        let message = tokio::select! {
            _ = read_close_rx.changed() => break,
            message = ws_rx.next() => message,
        };

        match message {
            Some(Ok(ws::Message::Text(text))) => {
                session.touch();
                match serde_json::from_str::<AgentFrame>(&text) {
                    Ok(frame) => {
                        super::inbound::handle_frame(&state, &session, frame).await;
                    }
                    Err(e) => {
                        tracing::warn!(%agent_id, error = %e, "dropping malformed frame");
                    }
                }
            }
            Some(Ok(ws::Message::Pong(_) | ws::Message::Ping(_))) => session.touch(),
            Some(Ok(ws::Message::Close(_))) | None => break,
            Some(Ok(ws::Message::Binary(_))) => {
                tracing::debug!(%agent_id, "ignoring binary frame");
            }
            Some(Err(e)) => {
                tracing::debug!(%agent_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    state.hub.unregister(&agent_id, connection_id).await;
    session.close("read pump exited");
    let _ = write_pump.await;
    tracing::info!(%agent_id, %connection_id, "agent disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_frame() -> ControlFrame {
        ControlFrame::Cancel {
            command_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn send_queue_overflows_to_backpressure() {
        let (session, _frames_rx, _close_rx) =
            AgentSession::new("a1".into(), "10.0.0.1:9000".into());
        for _ in 0..SEND_QUEUE_CAPACITY {
            session.send(control_frame()).unwrap();
        }
        let err = session.send(control_frame()).unwrap_err();
        assert!(matches!(err, DispatchError::Backpressure));
    }

    #[tokio::test]
    async fn send_recovers_after_drain() {
        let (session, mut frames_rx, _close_rx) =
            AgentSession::new("a1".into(), "10.0.0.1:9000".into());
        for _ in 0..SEND_QUEUE_CAPACITY {
            session.send(control_frame()).unwrap();
        }
        assert!(session.send(control_frame()).is_err());
        frames_rx.recv().await.unwrap();
        session.send(control_frame()).unwrap();
    }

    #[tokio::test]
    async fn fresh_session_is_not_stale() {
        let (session, _frames_rx, _close_rx) =
            AgentSession::new("a1".into(), "10.0.0.1:9000".into());
        assert!(!session.is_stale(Utc::now()));
    }

    #[tokio::test]
    async fn session_goes_stale_past_threshold() {
        let (session, _frames_rx, _close_rx) =
            AgentSession::new("a1".into(), "10.0.0.1:9000".into());
        let future = Utc::now() + chrono::Duration::seconds(protocol::STALE_AFTER_SECS as i64 + 1);
        assert!(session.is_stale(future));
        // A frame arriving resets the clock.
        session.touch();
        assert!(!session.is_stale(Utc::now()));
    }

    #[tokio::test]
    async fn close_signal_reaches_watchers() {
        let (session, _frames_rx, mut close_rx) =
            AgentSession::new("a1".into(), "10.0.0.1:9000".into());
        session.close("replaced");
        close_rx.changed().await.unwrap();
        assert_eq!(close_rx.borrow().as_deref(), Some("replaced"));
    }

    #[tokio::test]
    async fn session_refs_hub_by_id_only() {
        let (session, _frames_rx, _close_rx) =
            AgentSession::new("k8s-prod-cluster".into(), "10.0.0.1:9000".into());
        assert_eq!(session.agent_id, "k8s-prod-cluster");
        assert_ne!(session.connection_id, Uuid::nil());
    }
}
