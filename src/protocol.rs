use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution platforms
// ---------------------------------------------------------------------------

/// Backend kind an agent manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Kubernetes,
    Docker,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Docker => "docker",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(Self::Kubernetes),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// User-visible session lifecycle state, mirrored into the `sessions` row
/// from agent `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Starting,
    Running,
    Hibernating,
    Hibernated,
    Terminating,
    Terminated,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Hibernating => "hibernating",
            Self::Hibernated => "hibernated",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "hibernating" => Ok(Self::Hibernating),
            "hibernated" => Ok(Self::Hibernated),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Structured error kinds
// ---------------------------------------------------------------------------

/// Error kinds carried inside `command_result` frames and stored on failed
/// command rows. These are wire-stable strings, never free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AgentUnreachable,
    Backpressure,
    ManifestMissing,
    PermissionDenied,
    Timeout,
    NotSupported,
    PlatformError,
    NoAgentsAvailable,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentUnreachable => "agent_unreachable",
            Self::Backpressure => "backpressure",
            Self::ManifestMissing => "manifest_missing",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::NotSupported => "not_supported",
            Self::PlatformError => "platform_error",
            Self::NoAgentsAvailable => "no_agents_available",
            Self::Conflict => "conflict",
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Session template carried by value inside `start_session` payloads.
/// The control plane is the single source of truth; agents never fetch
/// templates from their own cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub spec: TemplateSpec,
}

/// Template manifest. Keys are camelCase on the wire per the agent
/// protocol contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    pub base_image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub default_resources: Option<ResourceSpec>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    pub name: String,
    pub mount_path: String,
}

/// Requested compute resources for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub memory: String,
    pub cpu: String,
}

/// Declared agent capacity, reported at register time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapacity {
    #[serde(rename = "maxCPU")]
    pub max_cpu: String,
    #[serde(rename = "maxMem")]
    pub max_mem: String,
    #[serde(rename = "maxSessions")]
    pub max_sessions: i32,
}

// ---------------------------------------------------------------------------
// Command bodies
// ---------------------------------------------------------------------------

/// A command's `action` + `payload` pair, statically typed per action.
/// Serializes to `{"action": "...", "payload": {...}}` so the store only
/// ever sees already-shaped JSON; native maps never cross the SQL
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum CommandBody {
    StartSession(StartSessionPayload),
    StopSession(SessionRefPayload),
    HibernateSession(SessionRefPayload),
    WakeSession(SessionRefPayload),
}

impl CommandBody {
    pub fn action(&self) -> &'static str {
        match self {
            Self::StartSession(_) => "start_session",
            Self::StopSession(_) => "stop_session",
            Self::HibernateSession(_) => "hibernate_session",
            Self::WakeSession(_) => "wake_session",
        }
    }

    /// The session this command addresses.
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::StartSession(p) => p.session_id,
            Self::StopSession(p) | Self::HibernateSession(p) | Self::WakeSession(p) => {
                p.session_id
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionPayload {
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    pub template: Template,
    pub resources: ResourceSpec,
    #[serde(rename = "persistentHome", default)]
    pub persistent_home: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRefPayload {
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Frames an agent sends to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Register {
        #[serde(rename = "agentID")]
        agent_id: String,
        platform: Platform,
        region: String,
        capacity: AgentCapacity,
        #[serde(rename = "apiKey")]
        api_key: String,
    },
    Heartbeat {
        #[serde(rename = "agentID")]
        agent_id: String,
        status: String,
        #[serde(rename = "activeSessions")]
        active_sessions: i64,
    },
    CommandAck {
        #[serde(rename = "commandID")]
        command_id: Uuid,
    },
    CommandResult {
        #[serde(rename = "commandID")]
        command_id: Uuid,
        ok: bool,
        #[serde(rename = "errorKind", default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Status {
        #[serde(rename = "sessionID")]
        session_id: Uuid,
        state: SessionState,
        #[serde(rename = "podRef", default, skip_serializing_if = "Option::is_none")]
        pod_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Frames the control plane sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Command {
        #[serde(rename = "commandID")]
        command_id: Uuid,
        #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(flatten)]
        body: CommandBody,
    },
    Cancel {
        #[serde(rename = "commandID")]
        command_id: Uuid,
    },
}

/// Envelope published on `pod:{podID}:commands` when a frame must hop to
/// the control-plane process that owns the target agent's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEnvelope {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub frame: ControlFrame,
}

/// Everything that can land on a pod command channel: routed frames, plus
/// the takeover notice a new owner publishes so the previous owner drops
/// its now-superseded local session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PodMessage {
    Takeover {
        #[serde(rename = "takeover")]
        agent_id: String,
    },
    Route(RouteEnvelope),
}

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Agent heartbeat interval.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A connection that has produced no frame for this long is stale. The
/// slack over `2*H` absorbs heartbeat jitter after a control-plane pod
/// restart; a tight `>H` threshold caused spurious disconnections.
pub const STALE_AFTER_SECS: u64 = 2 * HEARTBEAT_INTERVAL_SECS + 5;

/// TTL for the Redis agent-ownership keys, refreshed on every heartbeat.
pub const OWNERSHIP_TTL_SECS: i64 = 4 * HEARTBEAT_INTERVAL_SECS as i64;

/// Redis key pointing an agent id at the control-plane pod that owns its
/// socket.
pub fn ownership_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:pod")
}

/// Redis presence marker for a connected agent.
pub fn connected_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:connected")
}

/// Redis pub/sub channel a control-plane pod listens on for routed frames.
pub fn pod_channel(pod_id: &str) -> String {
    format!("pod:{pod_id}:commands")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            name: Some("firefox-browser".into()),
            version: Some("1.2.0".into()),
            spec: TemplateSpec {
                base_image: "ghcr.io/streamspace/firefox:128".into(),
                ports: vec![5900, 8080],
                default_resources: Some(ResourceSpec {
                    memory: "1Gi".into(),
                    cpu: "500m".into(),
                }),
                capabilities: vec!["audio".into()],
                volume_mounts: vec![VolumeMountSpec {
                    name: "home".into(),
                    mount_path: "/home/user".into(),
                }],
            },
        }
    }

    #[test]
    fn register_frame_wire_shape() {
        let frame = AgentFrame::Register {
            agent_id: "k8s-prod-cluster".into(),
            platform: Platform::Kubernetes,
            region: "eu-west-1".into(),
            capacity: AgentCapacity {
                max_cpu: "16".into(),
                max_mem: "64Gi".into(),
                max_sessions: 50,
            },
            api_key: "ssp_agent_abc".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "register");
        assert_eq!(v["agentID"], "k8s-prod-cluster");
        assert_eq!(v["platform"], "kubernetes");
        assert_eq!(v["capacity"]["maxSessions"], 50);
        assert_eq!(v["apiKey"], "ssp_agent_abc");
    }

    #[test]
    fn command_frame_carries_action_and_payload() {
        let session_id = Uuid::new_v4();
        let frame = ControlFrame::Command {
            command_id: Uuid::new_v4(),
            session_id: Some(session_id),
            body: CommandBody::StartSession(StartSessionPayload {
                session_id,
                template: template(),
                resources: ResourceSpec {
                    memory: "1Gi".into(),
                    cpu: "500m".into(),
                },
                persistent_home: false,
            }),
        };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "command");
        assert_eq!(v["action"], "start_session");
        assert_eq!(v["payload"]["sessionID"], session_id.to_string());
        assert_eq!(
            v["payload"]["template"]["spec"]["baseImage"],
            "ghcr.io/streamspace/firefox:128"
        );
        assert_eq!(v["payload"]["template"]["spec"]["volumeMounts"][0]["mountPath"], "/home/user");
    }

    #[test]
    fn command_frame_round_trips() {
        let session_id = Uuid::new_v4();
        let frame = ControlFrame::Command {
            command_id: Uuid::new_v4(),
            session_id: Some(session_id),
            body: CommandBody::HibernateSession(SessionRefPayload { session_id }),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ControlFrame = serde_json::from_str(&json).unwrap();
        match back {
            ControlFrame::Command { body, .. } => {
                assert_eq!(body.action(), "hibernate_session");
                assert_eq!(body.session_id(), session_id);
            }
            ControlFrame::Cancel { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn heartbeat_parses_from_raw_json() {
        let raw = r#"{"type":"heartbeat","agentID":"docker-lab","status":"online","activeSessions":3}"#;
        let frame: AgentFrame = serde_json::from_str(raw).unwrap();
        match frame {
            AgentFrame::Heartbeat {
                agent_id,
                active_sessions,
                ..
            } => {
                assert_eq!(agent_id, "docker-lab");
                assert_eq!(active_sessions, 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn command_result_omits_empty_fields() {
        let frame = AgentFrame::CommandResult {
            command_id: Uuid::new_v4(),
            ok: true,
            error_kind: None,
            message: None,
            data: None,
        };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert!(v.get("errorKind").is_none());
        assert!(v.get("message").is_none());
    }

    #[test]
    fn error_kind_wire_strings() {
        assert_eq!(
            serde_json::to_value(ErrorKind::AgentUnreachable).unwrap(),
            "agent_unreachable"
        );
        assert_eq!(ErrorKind::NoAgentsAvailable.as_str(), "no_agents_available");
    }

    #[test]
    fn malformed_frame_is_an_error_not_a_panic() {
        let raw = r#"{"type":"register","agentID":42}"#;
        assert!(serde_json::from_str::<AgentFrame>(raw).is_err());
        let raw = r#"{"type":"warp_core_breach"}"#;
        assert!(serde_json::from_str::<AgentFrame>(raw).is_err());
    }

    #[test]
    fn route_envelope_round_trips() {
        let env = RouteEnvelope {
            agent_id: "k8s-prod-cluster".into(),
            frame: ControlFrame::Cancel {
                command_id: Uuid::new_v4(),
            },
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: RouteEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, "k8s-prod-cluster");
        assert!(matches!(back.frame, ControlFrame::Cancel { .. }));
    }

    #[test]
    fn stale_threshold_has_restart_slack() {
        assert_eq!(STALE_AFTER_SECS, 65);
        assert!(STALE_AFTER_SECS > 2 * HEARTBEAT_INTERVAL_SECS);
    }

    #[test]
    fn redis_key_shapes() {
        assert_eq!(ownership_key("a1"), "agent:a1:pod");
        assert_eq!(connected_key("a1"), "agent:a1:connected");
        assert_eq!(pod_channel("cp-7d9f"), "pod:cp-7d9f:commands");
    }

    #[test]
    fn pod_message_distinguishes_takeover_from_route() {
        let takeover: PodMessage = serde_json::from_str(r#"{"takeover":"a1"}"#).unwrap();
        assert!(matches!(takeover, PodMessage::Takeover { agent_id } if agent_id == "a1"));

        let route = serde_json::to_string(&PodMessage::Route(RouteEnvelope {
            agent_id: "a1".into(),
            frame: ControlFrame::Cancel {
                command_id: Uuid::new_v4(),
            },
        }))
        .unwrap();
        let parsed: PodMessage = serde_json::from_str(&route).unwrap();
        assert!(matches!(parsed, PodMessage::Route(_)));
    }

    #[test]
    fn template_spec_rejects_missing_spec() {
        let raw = r#"{"name":"x"}"#;
        assert!(serde_json::from_str::<Template>(raw).is_err());
    }
}
