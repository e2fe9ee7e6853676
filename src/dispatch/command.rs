use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{CommandBody, ControlFrame};

use super::error::DispatchError;

// ---------------------------------------------------------------------------
// Command status machine
// ---------------------------------------------------------------------------

/// Durable command state. Advances monotonically
/// `pending → sent → acknowledged → completed`; any non-terminal state may
/// fall to `failed`. The one sanctioned backward edge is the dispatcher
/// releasing a claimed-but-undeliverable command from `sent` back to
/// `pending` before any ack arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_advance_to(self, next: CommandStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Sent)
            | (Self::Sent, Self::Acknowledged)
            | (Self::Sent, Self::Completed)
            | (Self::Acknowledged, Self::Completed)
            | (Self::Sent, Self::Pending) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "acknowledged" => Ok(Self::Acknowledged),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

impl TryFrom<String> for CommandStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Command row
// ---------------------------------------------------------------------------

/// An `agent_commands` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Command {
    pub command_id: Uuid,
    pub agent_id: String,
    pub session_id: Option<Uuid>,
    pub action: String,
    pub payload: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub status: CommandStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

impl Command {
    /// Seconds since this command was enqueued.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    /// Reassemble the wire frame from the stored `action` + `payload`
    /// columns. Fails if the stored payload no longer matches the action's
    /// schema, which indicates row corruption rather than a caller bug.
    pub fn wire_frame(&self) -> Result<ControlFrame, DispatchError> {
        let body: CommandBody = serde_json::from_value(serde_json::json!({
            "action": self.action,
            "payload": self.payload,
        }))?;
        Ok(ControlFrame::Command {
            command_id: self.command_id,
            session_id: self.session_id,
            body,
        })
    }
}
