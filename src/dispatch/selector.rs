use sqlx::PgPool;

use crate::protocol::Platform;

use super::error::DispatchError;

/// An online agent picked for a new session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SelectedAgent {
    pub agent_id: String,
    pub live_sessions: i64,
}

/// Pick the least-loaded online agent for a platform.
///
/// Load is computed live by joining `sessions`: there is no denormalized
/// `active_sessions` column on `agents` because it drifts. Ties break
/// toward the freshest heartbeat. Live WebSocket presence is not checked
/// here; the stale sweep is responsible for flipping dead agents to
/// `offline` before selection can see them.
#[tracing::instrument(skip(pool), err)]
pub async fn pick_agent(
    pool: &PgPool,
    platform: Platform,
) -> Result<SelectedAgent, DispatchError> {
    let picked = sqlx::query_as::<_, SelectedAgent>(
        "SELECT a.agent_id, COUNT(s.id) AS live_sessions \
         FROM agents a \
         LEFT JOIN sessions s \
           ON s.agent_id = a.agent_id AND s.state IN ('starting', 'running') \
         WHERE a.platform = $1 AND a.status = 'online' \
         GROUP BY a.agent_id, a.last_heartbeat \
         ORDER BY COUNT(s.id) ASC, a.last_heartbeat DESC NULLS LAST \
         LIMIT 1",
    )
    .bind(platform.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or(DispatchError::NoAgentsAvailable)?;

    tracing::debug!(agent_id = %picked.agent_id, live = picked.live_sessions, "agent selected");
    Ok(picked)
}
