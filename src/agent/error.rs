use crate::platform::DriverError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Disconnected,

    #[error("leadership lost")]
    LeadershipLost,

    #[error("ha enabled but no coordination backend: {0}")]
    NoCoordinationBackend(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Protocol(#[from] serde_json::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
