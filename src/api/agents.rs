use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApiError;
use crate::hub::session::run_agent_connection;
use crate::store::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AgentResponse {
    pub agent_id: String,
    pub platform: String,
    pub region: String,
    pub status: String,
    pub capacity: Option<serde_json::Value>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub live_sessions: i64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/ws", get(agent_ws))
}

/// Fleet listing with live session counts, computed from `sessions` the
/// same way the selector sees them.
async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentResponse>>, ApiError> {
    let rows = sqlx::query_as::<_, AgentResponse>(
        "SELECT a.agent_id, a.platform, a.region, a.status, a.capacity, a.last_heartbeat, \
                COUNT(s.id) AS live_sessions \
         FROM agents a \
         LEFT JOIN sessions s \
           ON s.agent_id = a.agent_id AND s.state IN ('starting', 'running') \
         GROUP BY a.agent_id \
         ORDER BY a.agent_id",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

/// Agent WebSocket endpoint. Authentication happens on the first frame:
/// the upgrade succeeds unconditionally, then the connection is dropped
/// unless a valid `register` arrives within the deadline.
async fn agent_ws(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_agent_connection(state, socket, addr.to_string()))
}
