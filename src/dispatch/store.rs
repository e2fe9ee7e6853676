use sqlx::PgPool;
use uuid::Uuid;

use crate::protocol::{CommandBody, ErrorKind};

use super::command::Command;
use super::error::DispatchError;

const COMMAND_COLUMNS: &str = "command_id, agent_id, session_id, action, payload, status, \
     error_message, created_at, updated_at, sent_at, acknowledged_at, completed_at, retry_count";

/// Durable queue of agent commands. Rows are shared across control-plane
/// processes; every state transition is a conditional UPDATE so concurrent
/// writers cannot skip or rewind states.
#[derive(Clone)]
pub struct CommandStore {
    pool: PgPool,
}

impl CommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a command in `pending`. The typed body is serialized here,
    /// once; nothing downstream of this call ever hands a native map to
    /// the SQL driver.
    #[tracing::instrument(skip(self, body), fields(%agent_id), err)]
    pub async fn insert(
        &self,
        agent_id: &str,
        body: &CommandBody,
    ) -> Result<Command, DispatchError> {
        let command_id = Uuid::new_v4();
        let session_id = body.session_id();
        // Adjacent tagging shapes the body as {"action": ..., "payload": ...};
        // only the payload object lands in the jsonb column.
        let mut tagged = serde_json::to_value(body)?;
        let payload = tagged
            .as_object_mut()
            .and_then(|obj| obj.remove("payload"))
            .unwrap_or_else(|| serde_json::json!({}));

        let command = sqlx::query_as::<_, Command>(&format!(
            "INSERT INTO agent_commands (command_id, agent_id, session_id, action, payload, status) \
             VALUES ($1, $2, $3, $4, $5, 'pending') \
             RETURNING {COMMAND_COLUMNS}"
        ))
        .bind(command_id)
        .bind(agent_id)
        .bind(session_id)
        .bind(body.action())
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(%command_id, action = body.action(), "command enqueued");
        Ok(command)
    }

    pub async fn fetch(&self, command_id: Uuid) -> Result<Option<Command>, DispatchError> {
        let row = sqlx::query_as::<_, Command>(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands WHERE command_id = $1"
        ))
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Atomically claim up to `batch` pending commands, marking them
    /// `sent`. `SKIP LOCKED` keeps two dispatcher processes from claiming
    /// the same row. Rows older than `max_age_secs` are left for the
    /// timeout sweep to bury.
    pub async fn claim_pending(
        &self,
        batch: i64,
        max_age_secs: i64,
    ) -> Result<Vec<Command>, DispatchError> {
        let rows = sqlx::query_as::<_, Command>(&format!(
            "UPDATE agent_commands SET status = 'sent', sent_at = now(), updated_at = now() \
             WHERE command_id IN ( \
                 SELECT command_id FROM agent_commands \
                 WHERE status = 'pending' \
                   AND created_at > now() - make_interval(secs => $2) \
                 ORDER BY created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COMMAND_COLUMNS}"
        ))
        .bind(batch)
        .bind(max_age_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Undo a claim for a command that could not be handed to its agent.
    /// Only legal while the row is still `sent` with no ack; bumps the
    /// retry counter so operators can spot flapping agents.
    pub async fn release_for_retry(&self, command_id: Uuid) -> Result<(), DispatchError> {
        let res = sqlx::query(
            "UPDATE agent_commands \
             SET status = 'pending', sent_at = NULL, retry_count = retry_count + 1, \
                 updated_at = now() \
             WHERE command_id = $1 AND status = 'sent' AND acknowledged_at IS NULL",
        )
        .bind(command_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(DispatchError::Conflict(format!(
                "command {command_id} no longer releasable"
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%command_id), err)]
    pub async fn mark_acknowledged(&self, command_id: Uuid) -> Result<(), DispatchError> {
        self.transition(
            command_id,
            "UPDATE agent_commands \
             SET status = 'acknowledged', acknowledged_at = now(), updated_at = now() \
             WHERE command_id = $1 AND status = 'sent'",
        )
        .await
    }

    /// Terminal success. `acknowledged_at` is backfilled when the ack frame
    /// was lost or raced the result, so completed rows always carry the
    /// full timestamp chain.
    #[tracing::instrument(skip(self), fields(%command_id), err)]
    pub async fn mark_completed(&self, command_id: Uuid) -> Result<(), DispatchError> {
        self.transition(
            command_id,
            "UPDATE agent_commands \
             SET status = 'completed', completed_at = now(), \
                 acknowledged_at = COALESCE(acknowledged_at, now()), updated_at = now() \
             WHERE command_id = $1 AND status IN ('sent', 'acknowledged')",
        )
        .await
    }

    #[tracing::instrument(skip(self, message), fields(%command_id, kind = kind.as_str()), err)]
    pub async fn mark_failed(
        &self,
        command_id: Uuid,
        kind: ErrorKind,
        message: &str,
    ) -> Result<(), DispatchError> {
        let res = sqlx::query(
            "UPDATE agent_commands \
             SET status = 'failed', error_message = $2, completed_at = now(), \
                 updated_at = now() \
             WHERE command_id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(command_id)
        .bind(format!("{}: {message}", kind.as_str()))
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(DispatchError::Conflict(format!(
                "command {command_id} already terminal"
            )));
        }
        Ok(())
    }

    /// Fail every `sent` command whose ack deadline has passed. Returns
    /// the buried rows so the dispatcher can publish best-effort cancels.
    pub async fn fail_timed_out(
        &self,
        ack_timeout_secs: i64,
    ) -> Result<Vec<Command>, DispatchError> {
        let rows = sqlx::query_as::<_, Command>(&format!(
            "UPDATE agent_commands \
             SET status = 'failed', error_message = 'timeout: no ack within deadline', \
                 completed_at = now(), updated_at = now() \
             WHERE status = 'sent' \
               AND sent_at < now() - make_interval(secs => $1) \
             RETURNING {COMMAND_COLUMNS}"
        ))
        .bind(ack_timeout_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Fail pending commands that aged past the claim window without ever
    /// being deliverable.
    pub async fn fail_expired_pending(
        &self,
        max_age_secs: i64,
    ) -> Result<Vec<Command>, DispatchError> {
        let rows = sqlx::query_as::<_, Command>(&format!(
            "UPDATE agent_commands \
             SET status = 'failed', error_message = 'timeout: expired before delivery', \
                 completed_at = now(), updated_at = now() \
             WHERE status = 'pending' \
               AND created_at <= now() - make_interval(secs => $1) \
             RETURNING {COMMAND_COLUMNS}"
        ))
        .bind(max_age_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn transition(&self, command_id: Uuid, sql: &str) -> Result<(), DispatchError> {
        let res = sqlx::query(sql).bind(command_id).execute(&self.pool).await?;
        if res.rows_affected() == 0 {
            return Err(DispatchError::Conflict(format!(
                "illegal transition for command {command_id}"
            )));
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
