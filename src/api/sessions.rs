use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch;
use crate::error::ApiError;
use crate::protocol::{
    CommandBody, Platform, ResourceSpec, SessionRefPayload, SessionState, StartSessionPayload,
    Template,
};
use crate::store::{AppState, sessions};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user: String,
    /// Full template manifest, resolved by the catalog layer upstream.
    /// Carried by value into the agent command; agents never fetch it.
    pub template: Template,
    pub resources: ResourceSpec,
    #[serde(rename = "persistentHome", default)]
    pub persistent_home: bool,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    pub state: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SessionAccepted {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "commandId")]
    pub command_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub user_id: String,
    pub template_ref: String,
    pub agent_id: String,
    pub state: String,
    pub pod_ref: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<sessions::Session> for SessionResponse {
    fn from(s: sessions::Session) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            template_ref: s.template_ref,
            agent_id: s.agent_id,
            state: s.state,
            pod_ref: s.pod_ref,
            url: s.url,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(stop_session))
        .route("/api/sessions/{id}/hibernate", post(hibernate_session))
        .route("/api/sessions/{id}/wake", post(wake_session))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[tracing::instrument(skip(state, body), err)]
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.user.trim().is_empty() {
        return Err(ApiError::BadRequest("user is required".into()));
    }
    if body.template.spec.base_image.trim().is_empty() {
        return Err(ApiError::BadRequest("template has no baseImage".into()));
    }

    let platform = body.platform.unwrap_or(Platform::Kubernetes);

    // Selection happens before anything is written: with no agent online
    // there must be no session row and no command row.
    let picked = dispatch::pick_agent(&state.pool, platform).await?;

    let template_ref = body
        .template
        .name
        .clone()
        .unwrap_or_else(|| "inline".into());
    let session = sessions::insert(
        &state.pool,
        &body.user,
        &template_ref,
        &picked.agent_id,
        &body.resources,
    )
    .await?;

    let command = state
        .commands
        .insert(
            &picked.agent_id,
            &CommandBody::StartSession(StartSessionPayload {
                session_id: session.id,
                template: body.template,
                resources: body.resources,
                persistent_home: body.persistent_home,
            }),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SessionAccepted {
            session_id: session.id,
            agent_id: picked.agent_id,
            command_id: command.command_id,
        }),
    ))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListSessionsParams>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(100);
    let offset = params.offset.unwrap_or(0);
    let rows = sessions::list(&state.pool, params.state.as_deref(), limit, offset).await?;
    Ok(Json(rows.into_iter().map(SessionResponse::from).collect()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = sessions::fetch(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;
    Ok(Json(session.into()))
}

#[tracing::instrument(skip(state), fields(%id), err)]
async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_lifecycle(
        &state,
        id,
        SessionState::Terminating,
        |session_id| CommandBody::StopSession(SessionRefPayload { session_id }),
    )
    .await
}

#[tracing::instrument(skip(state), fields(%id), err)]
async fn hibernate_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_lifecycle(
        &state,
        id,
        SessionState::Hibernating,
        |session_id| CommandBody::HibernateSession(SessionRefPayload { session_id }),
    )
    .await
}

#[tracing::instrument(skip(state), fields(%id), err)]
async fn wake_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    enqueue_lifecycle(
        &state,
        id,
        SessionState::Starting,
        |session_id| CommandBody::WakeSession(SessionRefPayload { session_id }),
    )
    .await
}

/// Shared shape of the post-creation lifecycle endpoints: look up the
/// session, enqueue a command for its agent, optimistically mark the
/// transitional state. The agent's status frames report the real outcome.
async fn enqueue_lifecycle(
    state: &AppState,
    id: Uuid,
    transitional: SessionState,
    make_body: impl FnOnce(Uuid) -> CommandBody,
) -> Result<(StatusCode, Json<SessionAccepted>), ApiError> {
    let session = sessions::fetch(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session".into()))?;

    let command = state
        .commands
        .insert(&session.agent_id, &make_body(session.id))
        .await?;

    if let Err(e) = sessions::set_state(&state.pool, session.id, transitional).await {
        tracing::warn!(session_id = %session.id, error = %e, "transitional state not recorded");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SessionAccepted {
            session_id: session.id,
            agent_id: session.agent_id,
            command_id: command.command_id,
        }),
    ))
}
