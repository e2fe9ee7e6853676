use std::time::Duration;

use chrono::Utc;

use crate::protocol;
use crate::store::AppState;

/// Periodic stale-connection sweep. Two jobs each tick: close local
/// sessions that have gone quiet past the stale threshold, and flip
/// overdue `agents` rows to offline. This task is the only writer of the
/// `online → offline` transition, so presence cannot drift between the
/// heartbeat path and the sweep.
pub async fn run(state: AppState, mut shutdown: tokio::sync::watch::Receiver<()>) {
    tracing::info!("stale sweep started");
    let mut tick =
        tokio::time::interval(Duration::from_secs(protocol::HEARTBEAT_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("stale sweep shutting down");
                break;
            }
            _ = tick.tick() => {
                sweep_local_sessions(&state);
                if let Err(e) = sweep_agent_rows(&state).await {
                    tracing::error!(error = %e, "offline sweep failed");
                }
            }
        }
    }
}

fn sweep_local_sessions(state: &AppState) {
    let now = Utc::now();
    for agent_id in state.hub.connected_agents() {
        let Some(session) = state.hub.local_session(&agent_id) else {
            continue;
        };
        if session.is_stale(now) {
            tracing::warn!(
                %agent_id,
                last_seen = %session.last_seen(),
                "closing stale agent connection"
            );
            session.close("stale connection");
        }
    }
}

async fn sweep_agent_rows(state: &AppState) -> Result<(), sqlx::Error> {
    let res = sqlx::query(
        "UPDATE agents SET status = 'offline' \
         WHERE status = 'online' \
           AND (last_heartbeat IS NULL \
                OR last_heartbeat < now() - make_interval(secs => $1))",
    )
    .bind(protocol::STALE_AFTER_SECS as f64)
    .execute(&state.pool)
    .await?;

    if res.rows_affected() > 0 {
        tracing::info!(count = res.rows_affected(), "agents marked offline");
    }
    Ok(())
}

