use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::protocol::{ResourceSpec, SessionState};

/// A `sessions` row. The dispatch core owns `state`, `pod_ref` and `url`,
/// which it mirrors from agent `status` frames.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub template_ref: String,
    pub agent_id: String,
    pub state: String,
    pub resource_spec: Option<serde_json::Value>,
    pub pod_ref: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SESSION_COLUMNS: &str =
    "id, user_id, template_ref, agent_id, state, resource_spec, pod_ref, url, \
     created_at, updated_at";

pub async fn insert(
    pool: &PgPool,
    user_id: &str,
    template_ref: &str,
    agent_id: &str,
    resources: &ResourceSpec,
) -> Result<Session, sqlx::Error> {
    let resource_spec = serde_json::json!({ "memory": resources.memory, "cpu": resources.cpu });
    sqlx::query_as::<_, Session>(&format!(
        "INSERT INTO sessions (id, user_id, template_ref, agent_id, state, resource_spec) \
         VALUES ($1, $2, $3, $4, 'pending', $5) \
         RETURNING {SESSION_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(template_ref)
    .bind(agent_id)
    .bind(&resource_spec)
    .fetch_one(pool)
    .await
}

pub async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list(
    pool: &PgPool,
    state: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE $1::text IS NULL OR state = $1 \
         ORDER BY created_at DESC \
         LIMIT $2 OFFSET $3"
    ))
    .bind(state)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Mirror an agent `status` frame into the row. `pod_ref` and `url` only
/// ever accumulate; a later frame without them does not erase what an
/// earlier one reported.
pub async fn apply_status(
    pool: &PgPool,
    session_id: Uuid,
    state: SessionState,
    pod_ref: Option<&str>,
    url: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sessions \
         SET state = $2, pod_ref = COALESCE($3, pod_ref), url = COALESCE($4, url) \
         WHERE id = $1",
    )
    .bind(session_id)
    .bind(state.as_str())
    .bind(pod_ref)
    .bind(url)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_state(
    pool: &PgPool,
    session_id: Uuid,
    state: SessionState,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET state = $2 WHERE id = $1")
        .bind(session_id)
        .bind(state.as_str())
        .execute(pool)
        .await?;
    Ok(())
}
