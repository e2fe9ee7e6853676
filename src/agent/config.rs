use clap::Parser;

use crate::protocol::{AgentCapacity, Platform};

/// Agent process configuration. Every flag can come from the environment,
/// which is how the Helm chart wires it.
#[derive(Debug, Clone, Parser)]
#[command(name = "streamspace-agent")]
pub struct AgentConfig {
    /// Control-plane WebSocket endpoint.
    #[arg(
        long,
        env = "STREAMSPACE_CONTROL_PLANE_URL",
        default_value = "ws://localhost:8080/api/agents/ws"
    )]
    pub control_plane_url: String,

    /// Logical agent identity, shared by all replicas of this agent.
    #[arg(long, env = "STREAMSPACE_AGENT_ID")]
    pub agent_id: String,

    /// API key issued when the operator registered this agent.
    #[arg(long, env = "STREAMSPACE_AGENT_KEY")]
    pub api_key: String,

    /// Execution backend this agent drives.
    #[arg(long, env = "STREAMSPACE_PLATFORM", default_value = "kubernetes")]
    pub platform: Platform,

    #[arg(long, env = "STREAMSPACE_REGION", default_value = "local")]
    pub region: String,

    /// Namespace for session workloads and the HA lease.
    #[arg(long, env = "STREAMSPACE_NAMESPACE", default_value = "streamspace")]
    pub namespace: String,

    /// Address sessions are reachable on when driving Docker.
    #[arg(long, env = "STREAMSPACE_DOCKER_HOST", default_value = "127.0.0.1")]
    pub docker_host: String,

    #[arg(long, env = "STREAMSPACE_MAX_SESSIONS", default_value_t = 20)]
    pub max_sessions: i32,

    #[arg(long, env = "STREAMSPACE_MAX_CPU", default_value = "8")]
    pub max_cpu: String,

    #[arg(long, env = "STREAMSPACE_MAX_MEM", default_value = "32Gi")]
    pub max_mem: String,

    /// Run active/standby across replicas sharing this agent id.
    #[arg(long, env = "STREAMSPACE_HA_ENABLED", default_value_t = false)]
    pub ha_enabled: bool,

    /// This replica's identity for the HA lease. Defaults to the pod
    /// hostname.
    #[arg(long, env = "HOSTNAME")]
    pub replica_name: Option<String>,

    #[arg(long, env = "STREAMSPACE_PROVISION_DEADLINE_SECS", default_value_t = 120)]
    pub provision_deadline_secs: u64,
}

impl AgentConfig {
    pub fn capacity(&self) -> AgentCapacity {
        AgentCapacity {
            max_cpu: self.max_cpu.clone(),
            max_mem: self.max_mem.clone(),
            max_sessions: self.max_sessions,
        }
    }

    pub fn replica_name(&self) -> String {
        self.replica_name
            .clone()
            .unwrap_or_else(|| format!("{}-replica", self.agent_id))
    }

    pub fn provision_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.provision_deadline_secs)
    }
}
