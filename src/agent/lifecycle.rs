use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::platform::{DriverError, PlatformDriver, ProvisionRequest};
use crate::protocol::{AgentFrame, CommandBody, ControlFrame, SessionState};

/// How many recently processed command ids are remembered for duplicate
/// suppression under at-least-once delivery.
const RECENT_COMMANDS: usize = 256;

/// Agent-side consumer of lifecycle commands. Reconciles each command
/// onto the platform driver and reports progress through `status` frames
/// plus a final `command_result`.
pub struct SessionLifecycleHandler {
    driver: Arc<dyn PlatformDriver>,
    provision_deadline: Duration,
    recent: Mutex<RecentCommands>,
    active: Mutex<HashSet<Uuid>>,
}

impl SessionLifecycleHandler {
    pub fn new(driver: Arc<dyn PlatformDriver>, provision_deadline: Duration) -> Self {
        Self {
            driver,
            provision_deadline,
            recent: Mutex::new(RecentCommands::new(RECENT_COMMANDS)),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Sessions this replica believes are live, reported in heartbeats.
    pub async fn active_sessions(&self) -> i64 {
        self.active.lock().await.len() as i64
    }

    /// Process one frame from the control plane. Always acks; duplicate
    /// commands are acked again but not re-executed, so redelivery cannot
    /// create a second pod.
    pub async fn handle(&self, frame: ControlFrame, out: &mpsc::Sender<AgentFrame>) {
        match frame {
            ControlFrame::Command {
                command_id, body, ..
            } => {
                send(out, AgentFrame::CommandAck { command_id }).await;

                if !self.recent.lock().await.insert(command_id) {
                    tracing::info!(%command_id, "duplicate command, ack re-sent only");
                    return;
                }

                self.execute(command_id, body, out).await;
            }
            ControlFrame::Cancel { command_id } => {
                // Best-effort: the work may be long finished or never seen.
                tracing::info!(%command_id, "cancel received");
            }
        }
    }

    async fn execute(
        &self,
        command_id: Uuid,
        body: CommandBody,
        out: &mpsc::Sender<AgentFrame>,
    ) {
        let session_id = body.session_id();
        let result = match body {
            CommandBody::StartSession(payload) => {
                self.start_session(session_id, payload.template, payload.resources, payload.persistent_home, out)
                    .await
            }
            CommandBody::StopSession(_) => self.stop_session(session_id, out).await,
            CommandBody::HibernateSession(_) => self.hibernate_session(session_id, out).await,
            CommandBody::WakeSession(_) => self.wake_session(session_id, out).await,
        };

        match result {
            Ok(data) => {
                send(
                    out,
                    AgentFrame::CommandResult {
                        command_id,
                        ok: true,
                        error_kind: None,
                        message: None,
                        data,
                    },
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(%command_id, %session_id, error = %e, "command failed");
                send(
                    out,
                    AgentFrame::CommandResult {
                        command_id,
                        ok: false,
                        error_kind: Some(e.kind()),
                        message: Some(e.to_string()),
                        data: None,
                    },
                )
                .await;
            }
        }
    }

    async fn start_session(
        &self,
        session_id: Uuid,
        template: crate::protocol::Template,
        resources: crate::protocol::ResourceSpec,
        persistent_home: bool,
        out: &mpsc::Sender<AgentFrame>,
    ) -> Result<Option<serde_json::Value>, DriverError> {
        self.emit_status(out, session_id, SessionState::Starting, None, None, None)
            .await;

        let req = ProvisionRequest {
            session_id,
            template,
            resources,
            persistent_home,
            deadline: self.provision_deadline,
        };

        let outcome = match self.with_one_retry(|| self.driver.provision(&req)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit_status(
                    out,
                    session_id,
                    SessionState::Failed,
                    None,
                    None,
                    Some(e.to_string()),
                )
                .await;
                return Err(e);
            }
        };

        self.active.lock().await.insert(session_id);
        self.emit_status(
            out,
            session_id,
            SessionState::Running,
            Some(outcome.pod_ref.clone()),
            Some(outcome.url.clone()),
            None,
        )
        .await;

        Ok(Some(serde_json::json!({
            "podRef": outcome.pod_ref,
            "url": outcome.url,
        })))
    }

    async fn stop_session(
        &self,
        session_id: Uuid,
        out: &mpsc::Sender<AgentFrame>,
    ) -> Result<Option<serde_json::Value>, DriverError> {
        self.emit_status(out, session_id, SessionState::Terminating, None, None, None)
            .await;

        self.with_one_retry(|| self.driver.teardown(session_id)).await?;

        self.active.lock().await.remove(&session_id);
        self.emit_status(out, session_id, SessionState::Terminated, None, None, None)
            .await;
        Ok(None)
    }

    async fn hibernate_session(
        &self,
        session_id: Uuid,
        out: &mpsc::Sender<AgentFrame>,
    ) -> Result<Option<serde_json::Value>, DriverError> {
        // On failure the session state is left untouched: no status frame
        // has been emitted yet.
        self.driver.hibernate(session_id).await?;

        self.active.lock().await.remove(&session_id);
        self.emit_status(out, session_id, SessionState::Hibernated, None, None, None)
            .await;
        Ok(None)
    }

    async fn wake_session(
        &self,
        session_id: Uuid,
        out: &mpsc::Sender<AgentFrame>,
    ) -> Result<Option<serde_json::Value>, DriverError> {
        self.driver.wake(session_id).await?;

        self.active.lock().await.insert(session_id);
        self.emit_status(out, session_id, SessionState::Running, None, None, None)
            .await;
        Ok(None)
    }

    /// Retry transient platform failures exactly once.
    async fn with_one_retry<T, F, Fut>(&self, op: F) -> Result<T, DriverError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, DriverError>>,
    {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "transient platform error, retrying once");
                op().await
            }
            other => other,
        }
    }

    async fn emit_status(
        &self,
        out: &mpsc::Sender<AgentFrame>,
        session_id: Uuid,
        state: SessionState,
        pod_ref: Option<String>,
        url: Option<String>,
        message: Option<String>,
    ) {
        send(
            out,
            AgentFrame::Status {
                session_id,
                state,
                pod_ref,
                url,
                message,
            },
        )
        .await;
    }
}

async fn send(out: &mpsc::Sender<AgentFrame>, frame: AgentFrame) {
    if out.send(frame).await.is_err() {
        tracing::warn!("outbound channel closed, frame dropped");
    }
}

// ---------------------------------------------------------------------------
// Duplicate suppression
// ---------------------------------------------------------------------------

struct RecentCommands {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentCommands {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false when the id was already present.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::platform::{BackendState, ProvisionOutcome};
    use crate::protocol::{
        Platform, ResourceSpec, SessionRefPayload, StartSessionPayload, Template, TemplateSpec,
    };

    /// Driver double that counts provisions and can fail on demand.
    struct FakeDriver {
        provisions: AtomicUsize,
        teardowns: AtomicUsize,
        fail_with: Option<fn() -> DriverError>,
        transient_failures: AtomicUsize,
    }

    impl FakeDriver {
        fn ok() -> Self {
            Self {
                provisions: AtomicUsize::new(0),
                teardowns: AtomicUsize::new(0),
                fail_with: None,
                transient_failures: AtomicUsize::new(0),
            }
        }

        fn failing(f: fn() -> DriverError) -> Self {
            Self {
                fail_with: Some(f),
                ..Self::ok()
            }
        }

        fn flaky(times: usize) -> Self {
            Self {
                transient_failures: AtomicUsize::new(times),
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl PlatformDriver for FakeDriver {
        async fn provision(
            &self,
            req: &ProvisionRequest,
        ) -> Result<ProvisionOutcome, DriverError> {
            if let Some(f) = self.fail_with {
                return Err(f());
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DriverError::Platform {
                    message: "flaky".into(),
                    transient: true,
                });
            }
            self.provisions.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionOutcome {
                pod_ref: format!("ssp-{}", &req.session_id.to_string()[..8]),
                url: "http://session.local:5900".into(),
            })
        }

        async fn teardown(&self, _session_id: Uuid) -> Result<(), DriverError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn hibernate(&self, _session_id: Uuid) -> Result<(), DriverError> {
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }

        async fn wake(&self, _session_id: Uuid) -> Result<(), DriverError> {
            Ok(())
        }

        async fn query_state(&self, _session_id: Uuid) -> Result<BackendState, DriverError> {
            Ok(BackendState::Running)
        }

        async fn healthcheck(&self) -> Result<(), DriverError> {
            Ok(())
        }

        fn platform(&self) -> Platform {
            Platform::Kubernetes
        }
    }

    fn start_command(session_id: Uuid, command_id: Uuid) -> ControlFrame {
        ControlFrame::Command {
            command_id,
            session_id: Some(session_id),
            body: CommandBody::StartSession(StartSessionPayload {
                session_id,
                template: Template {
                    name: Some("firefox-browser".into()),
                    version: None,
                    spec: TemplateSpec {
                        base_image: "streamspace/firefox:128".into(),
                        ports: vec![5900],
                        default_resources: None,
                        capabilities: vec![],
                        volume_mounts: vec![],
                    },
                },
                resources: ResourceSpec {
                    memory: "1Gi".into(),
                    cpu: "500m".into(),
                },
                persistent_home: false,
            }),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<AgentFrame>) -> Vec<AgentFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn start_session_acks_then_reports_running() {
        let handler = Arc::new(SessionLifecycleHandler::new(
            Arc::new(FakeDriver::ok()),
            Duration::from_secs(5),
        ));
        let (tx, mut rx) = mpsc::channel(32);
        let session_id = Uuid::new_v4();

        handler
            .handle(start_command(session_id, Uuid::new_v4()), &tx)
            .await;

        let frames = drain(&mut rx).await;
        assert!(matches!(frames[0], AgentFrame::CommandAck { .. }));
        assert!(matches!(
            frames[1],
            AgentFrame::Status { state: SessionState::Starting, .. }
        ));
        let running = frames.iter().find(|f| {
            matches!(f, AgentFrame::Status { state: SessionState::Running, .. })
        });
        assert!(running.is_some());
        let result = frames
            .iter()
            .find(|f| matches!(f, AgentFrame::CommandResult { .. }))
            .unwrap();
        match result {
            AgentFrame::CommandResult { ok, data, .. } => {
                assert!(*ok);
                let data = data.as_ref().unwrap();
                assert!(data["podRef"].as_str().unwrap().starts_with("ssp-"));
                assert!(data["url"].as_str().is_some());
            }
            _ => unreachable!(),
        }
        assert_eq!(handler.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn duplicate_command_does_not_reprovision() {
        let driver = Arc::new(FakeDriver::ok());
        let handler = SessionLifecycleHandler::new(
            Arc::clone(&driver) as Arc<dyn PlatformDriver>,
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let session_id = Uuid::new_v4();
        let command_id = Uuid::new_v4();

        handler.handle(start_command(session_id, command_id), &tx).await;
        handler.handle(start_command(session_id, command_id), &tx).await;

        assert_eq!(driver.provisions.load(Ordering::SeqCst), 1);
        let frames = drain(&mut rx).await;
        let acks = frames
            .iter()
            .filter(|f| matches!(f, AgentFrame::CommandAck { .. }))
            .count();
        assert_eq!(acks, 2);
    }

    #[tokio::test]
    async fn manifest_failure_reports_failed_session() {
        let handler = SessionLifecycleHandler::new(
            Arc::new(FakeDriver::failing(|| {
                DriverError::ManifestMissing("no baseImage".into())
            })),
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::channel(32);
        let session_id = Uuid::new_v4();

        handler
            .handle(start_command(session_id, Uuid::new_v4()), &tx)
            .await;

        let frames = drain(&mut rx).await;
        let result = frames
            .iter()
            .find(|f| matches!(f, AgentFrame::CommandResult { .. }))
            .unwrap();
        match result {
            AgentFrame::CommandResult { ok, error_kind, .. } => {
                assert!(!ok);
                assert_eq!(*error_kind, Some(crate::protocol::ErrorKind::ManifestMissing));
            }
            _ => unreachable!(),
        }
        assert!(frames.iter().any(|f| {
            matches!(f, AgentFrame::Status { state: SessionState::Failed, .. })
        }));
        assert_eq!(handler.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn transient_platform_error_is_retried_once() {
        let driver = Arc::new(FakeDriver::flaky(1));
        let handler = SessionLifecycleHandler::new(
            Arc::clone(&driver) as Arc<dyn PlatformDriver>,
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::channel(32);

        handler
            .handle(start_command(Uuid::new_v4(), Uuid::new_v4()), &tx)
            .await;

        assert_eq!(driver.provisions.load(Ordering::SeqCst), 1);
        let frames = drain(&mut rx).await;
        assert!(frames.iter().any(|f| {
            matches!(f, AgentFrame::CommandResult { ok: true, .. })
        }));
    }

    #[tokio::test]
    async fn stop_session_is_idempotent_and_terminal() {
        let driver = Arc::new(FakeDriver::ok());
        let handler = SessionLifecycleHandler::new(
            Arc::clone(&driver) as Arc<dyn PlatformDriver>,
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let session_id = Uuid::new_v4();

        // Stop of a session that never started still succeeds.
        let stop = ControlFrame::Command {
            command_id: Uuid::new_v4(),
            session_id: Some(session_id),
            body: CommandBody::StopSession(SessionRefPayload { session_id }),
        };
        handler.handle(stop, &tx).await;

        let frames = drain(&mut rx).await;
        assert!(frames.iter().any(|f| {
            matches!(f, AgentFrame::Status { state: SessionState::Terminated, .. })
        }));
        assert!(frames.iter().any(|f| {
            matches!(f, AgentFrame::CommandResult { ok: true, .. })
        }));
        assert_eq!(driver.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hibernate_failure_leaves_session_state_alone() {
        let handler = SessionLifecycleHandler::new(
            Arc::new(FakeDriver::failing(|| DriverError::NotSupported("hibernate"))),
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::channel(32);
        let session_id = Uuid::new_v4();

        let hibernate = ControlFrame::Command {
            command_id: Uuid::new_v4(),
            session_id: Some(session_id),
            body: CommandBody::HibernateSession(SessionRefPayload { session_id }),
        };
        handler.handle(hibernate, &tx).await;

        let frames = drain(&mut rx).await;
        // Failed result, but no status frame: the control plane keeps the
        // session in its previous state.
        assert!(frames.iter().any(|f| matches!(
            f,
            AgentFrame::CommandResult {
                ok: false,
                error_kind: Some(crate::protocol::ErrorKind::NotSupported),
                ..
            }
        )));
        assert!(!frames.iter().any(|f| matches!(f, AgentFrame::Status { .. })));
    }

    #[tokio::test]
    async fn cancel_for_unknown_command_is_tolerated() {
        let handler = SessionLifecycleHandler::new(
            Arc::new(FakeDriver::ok()),
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::channel(8);
        handler
            .handle(
                ControlFrame::Cancel {
                    command_id: Uuid::new_v4(),
                },
                &tx,
            )
            .await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[test]
    fn recent_commands_evicts_oldest() {
        let mut recent = RecentCommands::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(recent.insert(a));
        assert!(recent.insert(b));
        assert!(!recent.insert(a));
        assert!(recent.insert(c)); // evicts a
        assert!(recent.insert(a)); // a forgotten again
    }
}
