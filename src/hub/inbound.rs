use crate::dispatch::DispatchError;
use crate::protocol::{AgentFrame, ErrorKind, SessionState};
use crate::store::{AppState, sessions};

use super::session::AgentSession;

/// Demultiplex one inbound agent frame. Frame-level failures are logged
/// and swallowed here; a bad frame must never take the connection down.
pub async fn handle_frame(state: &AppState, session: &AgentSession, frame: AgentFrame) {
    match frame {
        AgentFrame::Register { .. } => {
            tracing::warn!(agent_id = %session.agent_id, "duplicate register frame ignored");
        }
        AgentFrame::Heartbeat {
            agent_id,
            active_sessions,
            ..
        } => {
            if agent_id != session.agent_id {
                tracing::warn!(
                    claimed = %agent_id,
                    actual = %session.agent_id,
                    "heartbeat for foreign agent id dropped"
                );
                return;
            }
            state.hub.heartbeat(&agent_id, active_sessions).await;
        }
        AgentFrame::CommandAck { command_id } => {
            match state.commands.mark_acknowledged(command_id).await {
                Ok(()) => tracing::debug!(%command_id, "command acknowledged"),
                Err(DispatchError::Conflict(_)) => {
                    // Redelivered command or ack raced the result; duplicate
                    // acks are expected under at-least-once delivery.
                    tracing::debug!(%command_id, "stale ack ignored");
                }
                Err(e) => tracing::error!(%command_id, error = %e, "ack update failed"),
            }
        }
        AgentFrame::CommandResult {
            command_id,
            ok,
            error_kind,
            message,
            data,
        } => {
            handle_result(state, command_id, ok, error_kind, message, data).await;
        }
        AgentFrame::Status {
            session_id,
            state: session_state,
            pod_ref,
            url,
            message,
        } => {
            if let Some(msg) = &message {
                tracing::info!(%session_id, state = session_state.as_str(), %msg, "session status");
            }
            if let Err(e) = sessions::apply_status(
                &state.pool,
                session_id,
                session_state,
                pod_ref.as_deref(),
                url.as_deref(),
            )
            .await
            {
                // Status persistence is best-effort; the next heartbeat
                // resync catches anything missed.
                tracing::error!(%session_id, error = %e, "status frame not persisted");
            }
        }
    }
}

async fn handle_result(
    state: &AppState,
    command_id: uuid::Uuid,
    ok: bool,
    error_kind: Option<ErrorKind>,
    message: Option<String>,
    data: Option<serde_json::Value>,
) {
    let command = match state.commands.fetch(command_id).await {
        Ok(Some(command)) => command,
        Ok(None) => {
            tracing::warn!(%command_id, "result for unknown command dropped");
            return;
        }
        Err(e) => {
            tracing::error!(%command_id, error = %e, "command lookup failed");
            return;
        }
    };

    if ok {
        match state.commands.mark_completed(command_id).await {
            Ok(()) => tracing::info!(%command_id, action = %command.action, "command completed"),
            Err(DispatchError::Conflict(_)) => {
                tracing::debug!(%command_id, "duplicate result ignored");
                return;
            }
            Err(e) => {
                tracing::error!(%command_id, error = %e, "completion update failed");
                return;
            }
        }

        // A successful provision reports where the session landed.
        if let (Some(session_id), Some(data)) = (command.session_id, &data) {
            let pod_ref = data.get("podRef").and_then(|v| v.as_str());
            let url = data.get("url").and_then(|v| v.as_str());
            if pod_ref.is_some() || url.is_some() {
                let current = sessions::fetch(&state.pool, session_id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|s| s.state.parse().ok())
                    .unwrap_or(SessionState::Running);
                if let Err(e) =
                    sessions::apply_status(&state.pool, session_id, current, pod_ref, url).await
                {
                    tracing::error!(%session_id, error = %e, "result data not persisted");
                }
            }
        }
    } else {
        let kind = error_kind.unwrap_or(ErrorKind::PlatformError);
        let msg = message.unwrap_or_else(|| "agent reported failure".into());
        match state.commands.mark_failed(command_id, kind, &msg).await {
            Ok(()) => {
                tracing::warn!(%command_id, kind = kind.as_str(), %msg, "command failed on agent");
            }
            Err(DispatchError::Conflict(_)) => {
                tracing::debug!(%command_id, "duplicate failure result ignored");
                return;
            }
            Err(e) => {
                tracing::error!(%command_id, error = %e, "failure update failed");
                return;
            }
        }

        // A session that never provisioned is failed; hibernate/wake
        // failures leave the session state untouched.
        if command.action == "start_session"
            && let Some(session_id) = command.session_id
            && let Err(e) = sessions::set_state(&state.pool, session_id, SessionState::Failed).await
        {
            tracing::error!(%session_id, error = %e, "failed session state not persisted");
        }
    }
}
