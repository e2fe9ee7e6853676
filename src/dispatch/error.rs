use crate::protocol::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("agent not connected")]
    AgentUnreachable,

    #[error("agent send queue full")]
    Backpressure,

    #[error("no agents available")]
    NoAgentsAvailable,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    /// Wire-stable kind for errors that cross the protocol boundary.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::AgentUnreachable => Some(ErrorKind::AgentUnreachable),
            Self::Backpressure => Some(ErrorKind::Backpressure),
            Self::NoAgentsAvailable => Some(ErrorKind::NoAgentsAvailable),
            Self::Conflict(_) => Some(ErrorKind::Conflict),
            Self::Db(_) | Self::Serialize(_) | Self::Other(_) => None,
        }
    }
}
