pub mod auth;
pub mod inbound;
pub mod session;
pub mod sweep;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fred::interfaces::{EventInterface, PubsubInterface};
use sqlx::PgPool;
use uuid::Uuid;

use crate::dispatch::DispatchError;
use crate::protocol::{
    self, AgentCapacity, ControlFrame, PodMessage, RouteEnvelope, connected_key, ownership_key,
    pod_channel,
};
use crate::store::valkey;

pub use session::AgentSession;

/// Redis write-through retry schedule. Routing is advisory, so after these
/// attempts the register proceeds anyway and the next heartbeat rewrites
/// the mapping.
const REDIS_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Fleet registry for one control-plane process: the live `agentID →
/// AgentSession` map plus the Redis-backed `agentID → ownerPodID` mapping
/// that lets any process deliver to any agent.
pub struct AgentHub {
    sessions: DashMap<String, Arc<AgentSession>>,
    pool: PgPool,
    valkey: fred::clients::Pool,
    pod_id: String,
}

impl AgentHub {
    pub fn new(pool: PgPool, valkey: fred::clients::Pool, pod_id: String) -> Self {
        Self {
            sessions: DashMap::new(),
            pool,
            valkey,
            pod_id,
        }
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn connected_agents(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn local_session(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.get(agent_id).map(|e| Arc::clone(e.value()))
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Attach a freshly authenticated session. Replaces any previous local
    /// session for the same agent, claims ownership in Redis, and flips
    /// the `agents` row online with the capacity the agent just declared.
    #[tracing::instrument(skip(self, session, capacity), fields(agent_id = %session.agent_id), err)]
    pub async fn register(
        &self,
        session: Arc<AgentSession>,
        region: &str,
        capacity: &AgentCapacity,
    ) -> Result<(), DispatchError> {
        let agent_id = session.agent_id.clone();

        if let Some(previous) = self.sessions.insert(agent_id.clone(), Arc::clone(&session)) {
            tracing::info!(%agent_id, "replacing existing local session");
            previous.close("replaced");
        }

        // Claim ownership. If another pod held the mapping, tell it to drop
        // its session: the agent has moved here.
        let previous_owner = valkey::get(&self.valkey, &ownership_key(&agent_id))
            .await
            .ok()
            .flatten();
        self.write_ownership(&agent_id).await;
        if let Some(owner) = previous_owner
            && owner != self.pod_id
        {
            let notice = serde_json::to_string(&PodMessage::Takeover {
                agent_id: agent_id.clone(),
            })
            .unwrap_or_default();
            if let Err(e) = valkey::publish(&self.valkey, &pod_channel(&owner), &notice).await {
                tracing::warn!(error = %e, %owner, "takeover notice not published");
            }
        }

        // Same write path as the heartbeat: presence and status move
        // together so they cannot drift apart.
        let capacity_json = serde_json::to_value(capacity)?;
        sqlx::query(
            "UPDATE agents \
             SET status = 'online', last_heartbeat = now(), region = $2, capacity = $3 \
             WHERE agent_id = $1",
        )
        .bind(&agent_id)
        .bind(region)
        .bind(&capacity_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Detach a session on disconnect. The `connection_id` guard keeps a
    /// late-exiting read pump from evicting the replacement session that
    /// took its slot. Flipping the `agents` row to offline is left to the
    /// stale sweep, the single writer of that transition.
    pub async fn unregister(&self, agent_id: &str, connection_id: Uuid) {
        let removed = self
            .sessions
            .remove_if(agent_id, |_, s| s.connection_id == connection_id)
            .is_some();
        if !removed {
            return;
        }

        // Only drop the Redis claim if it is still ours; a takeover by
        // another pod must not be erased by our own late cleanup.
        match valkey::get(&self.valkey, &ownership_key(agent_id)).await {
            Ok(Some(owner)) if owner == self.pod_id => {
                let _ = valkey::del(&self.valkey, &ownership_key(agent_id)).await;
                let _ = valkey::del(&self.valkey, &connected_key(agent_id)).await;
            }
            _ => {}
        }

        tracing::info!(%agent_id, %connection_id, "agent session unregistered");
    }

    /// Heartbeat write path: one statement refreshes both liveness and
    /// status, and the Redis claim gets its TTL pushed out.
    pub async fn heartbeat(&self, agent_id: &str, active_sessions: i64) {
        if let Some(session) = self.local_session(agent_id) {
            session.touch();
        }

        if let Err(e) = sqlx::query(
            "UPDATE agents SET status = 'online', last_heartbeat = now() WHERE agent_id = $1",
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(%agent_id, error = %e, "heartbeat row update failed");
        }

        let _ = valkey::expire(
            &self.valkey,
            &ownership_key(agent_id),
            protocol::OWNERSHIP_TTL_SECS,
        )
        .await;
        let _ = valkey::expire(
            &self.valkey,
            &connected_key(agent_id),
            protocol::OWNERSHIP_TTL_SECS,
        )
        .await;

        self.check_session_count(agent_id, active_sessions).await;
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Deliver a frame to an agent, wherever its socket lives. Local
    /// sessions get the frame enqueued directly; otherwise the Redis
    /// ownership mapping names the pod to route through.
    pub async fn deliver(&self, agent_id: &str, frame: ControlFrame) -> Result<(), DispatchError> {
        if self.try_local_deliver(agent_id, &frame)? {
            return Ok(());
        }

        let owner = match valkey::get(&self.valkey, &ownership_key(agent_id)).await {
            Ok(Some(owner)) => owner,
            Ok(None) => return Err(DispatchError::AgentUnreachable),
            Err(e) => {
                // Redis down degrades to single-process reachability; the
                // dispatcher retries the command either way.
                tracing::warn!(%agent_id, error = %e, "ownership lookup failed");
                return Err(DispatchError::AgentUnreachable);
            }
        };

        if owner == self.pod_id {
            // Mapping says us, but there is no local session: transient
            // inconsistency around a disconnect.
            return Err(DispatchError::AgentUnreachable);
        }

        let envelope = PodMessage::Route(RouteEnvelope {
            agent_id: agent_id.to_owned(),
            frame,
        });
        let json = serde_json::to_string(&envelope)?;
        valkey::publish(&self.valkey, &pod_channel(&owner), &json)
            .await
            .map_err(|e| {
                tracing::warn!(%agent_id, %owner, error = %e, "cross-pod publish failed");
                DispatchError::AgentUnreachable
            })?;

        tracing::debug!(%agent_id, %owner, "frame routed cross-pod");
        Ok(())
    }

    /// Local fast path. Returns Ok(false) when this process has no session
    /// for the agent.
    fn try_local_deliver(
        &self,
        agent_id: &str,
        frame: &ControlFrame,
    ) -> Result<bool, DispatchError> {
        match self.sessions.get(agent_id) {
            Some(session) => {
                session.send(frame.clone())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Redis subscription pump
    // -----------------------------------------------------------------------

    /// Listen on this pod's command channel and complete cross-pod hops by
    /// re-entering local delivery. Runs for the process lifetime.
    pub async fn run_subscription_pump(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<()>,
    ) {
        let subscriber = self.valkey.next().clone();
        let channel = pod_channel(&self.pod_id);

        if let Err(e) = subscriber.subscribe(channel.as_str()).await {
            tracing::error!(error = %e, %channel, "pod channel subscription failed");
            return;
        }
        tracing::info!(%channel, "subscribed to pod command channel");

        let mut rx = subscriber.message_rx();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => {
                    match msg {
                        Ok(message) => {
                            if let Ok(text) = message.value.convert::<String>() {
                                self.handle_pod_message(&text);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "subscription stream error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        let _ = subscriber.unsubscribe(channel.as_str()).await;
    }

    fn handle_pod_message(&self, text: &str) {
        match serde_json::from_str::<PodMessage>(text) {
            Ok(PodMessage::Takeover { agent_id }) => {
                if let Some((_, session)) = self.sessions.remove(&agent_id) {
                    tracing::info!(%agent_id, "agent taken over by another pod");
                    session.close("replaced");
                }
            }
            Ok(PodMessage::Route(envelope)) => {
                match self.try_local_deliver(&envelope.agent_id, &envelope.frame) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(agent_id = %envelope.agent_id, "routed frame for unknown local agent");
                    }
                    Err(e) => {
                        tracing::warn!(agent_id = %envelope.agent_id, error = %e, "routed frame dropped");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed pod message");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Write the ownership keys with bounded retries. Failure is logged,
    /// not fatal: the store keeps the command and the next heartbeat
    /// rewrites the mapping.
    async fn write_ownership(&self, agent_id: &str) {
        for (attempt, delay) in REDIS_RETRY_DELAYS.iter().enumerate() {
            let pod_write = valkey::set_with_ttl(
                &self.valkey,
                &ownership_key(agent_id),
                &self.pod_id,
                protocol::OWNERSHIP_TTL_SECS,
            )
            .await;
            let connected_write = valkey::set_with_ttl(
                &self.valkey,
                &connected_key(agent_id),
                "true",
                protocol::OWNERSHIP_TTL_SECS,
            )
            .await;

            match pod_write.and(connected_write) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(%agent_id, attempt, error = %e, "ownership write failed");
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        tracing::error!(%agent_id, "ownership write exhausted retries, routing degraded");
    }

    /// Reconciliation hook: the heartbeat's `activeSessions` count against
    /// our stored view. Drift is logged for follow-up rather than acted on.
    async fn check_session_count(&self, agent_id: &str, reported: i64) {
        let stored: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions \
             WHERE agent_id = $1 AND state IN ('starting', 'running')",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await;

        if let Ok(Some(stored)) = stored
            && stored != reported
        {
            tracing::warn!(
                %agent_id,
                stored,
                reported,
                "session count drift between agent and store"
            );
        }
    }
}
