use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::hub::AgentHub;
use crate::protocol::{ControlFrame, ErrorKind};

use super::command::Command;
use super::error::DispatchError;
use super::store::CommandStore;

/// How often the timeout sweep buries overdue commands.
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Worker-side pause after hitting a full send queue, so a saturated agent
/// is not hammered in a tight loop.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(250);

/// Consumes pending commands from the store and hands them to the hub for
/// delivery. One scanner, N workers, plus a timeout sweep. Multiple
/// control-plane processes may each run a dispatcher; `claim_pending`
/// semantics keep them from double-delivering a row.
pub struct CommandDispatcher {
    store: CommandStore,
    hub: Arc<AgentHub>,
    config: Arc<Config>,
}

impl CommandDispatcher {
    pub fn new(store: CommandStore, hub: Arc<AgentHub>, config: Arc<Config>) -> Self {
        Self { store, hub, config }
    }

    /// Run until shutdown. Spawns the worker pool, then drives the scanner
    /// and the timeout sweep from this task.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<()>) {
        tracing::info!(
            workers = self.config.dispatch_workers,
            scan_ms = self.config.dispatch_scan_ms,
            "command dispatcher started"
        );

        let (tx, rx) = mpsc::channel::<Command>((self.config.dispatch_batch as usize).max(1) * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..self.config.dispatch_workers {
            let dispatcher = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, rx, shutdown).await;
            });
        }

        let mut scan = tokio::time::interval(Duration::from_millis(self.config.dispatch_scan_ms));
        let mut sweep = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("command dispatcher shutting down");
                    break;
                }
                _ = scan.tick() => {
                    if let Err(e) = self.scan_once(&tx).await {
                        tracing::error!(error = %e, "dispatch scan failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_timeouts().await {
                        tracing::error!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
    }

    /// Claim a batch of pending commands and queue them for the workers.
    async fn scan_once(&self, tx: &mpsc::Sender<Command>) -> Result<(), DispatchError> {
        let claimed = self
            .store
            .claim_pending(self.config.dispatch_batch, self.config.command_max_age_secs)
            .await?;

        for command in claimed {
            if tx.send(command).await.is_err() {
                // Workers are gone; shutdown is in progress.
                break;
            }
        }
        Ok(())
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Command>>>,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            let command = tokio::select! {
                _ = shutdown.changed() => break,
                command = async { rx.lock().await.recv().await } => {
                    match command {
                        Some(c) => c,
                        None => break,
                    }
                }
            };

            if let Err(e) = self.deliver_command(command).await {
                tracing::error!(error = %e, worker_id, "command delivery bookkeeping failed");
            }
        }
    }

    /// Try to hand one claimed command to its agent and record the outcome.
    #[tracing::instrument(skip(self, command), fields(command_id = %command.command_id, agent_id = %command.agent_id))]
    async fn deliver_command(&self, command: Command) -> Result<(), DispatchError> {
        let frame = match command.wire_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "stored payload does not decode for its action");
                self.store
                    .mark_failed(
                        command.command_id,
                        ErrorKind::PlatformError,
                        "stored payload does not match action schema",
                    )
                    .await?;
                return Ok(());
            }
        };

        match self.hub.deliver(&command.agent_id, frame).await {
            Ok(()) => {
                // Row stays `sent`; the agent's async ack/result moves it on.
                Ok(())
            }
            Err(DispatchError::AgentUnreachable) => {
                let age = command.age_secs(Utc::now());
                if age < self.config.pending_grace_secs {
                    // Brief reconnect windows must not fail queued work.
                    self.ignore_conflict(self.store.release_for_retry(command.command_id).await);
                } else {
                    self.ignore_conflict(
                        self.store
                            .mark_failed(
                                command.command_id,
                                ErrorKind::AgentUnreachable,
                                "no live connection for agent",
                            )
                            .await,
                    );
                }
                Ok(())
            }
            Err(DispatchError::Backpressure) => {
                self.ignore_conflict(self.store.release_for_retry(command.command_id).await);
                tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "delivery failed, releasing for retry");
                self.ignore_conflict(self.store.release_for_retry(command.command_id).await);
                Ok(())
            }
        }
    }

    /// Bury overdue commands and send best-effort cancels for them.
    async fn sweep_timeouts(&self) -> Result<(), DispatchError> {
        let timed_out = self
            .store
            .fail_timed_out(self.config.ack_timeout_secs)
            .await?;

        for command in &timed_out {
            tracing::warn!(
                command_id = %command.command_id,
                agent_id = %command.agent_id,
                "command timed out waiting for ack"
            );
            let cancel = ControlFrame::Cancel {
                command_id: command.command_id,
            };
            if let Err(e) = self.hub.deliver(&command.agent_id, cancel).await {
                tracing::debug!(error = %e, "cancel not delivered");
            }
        }

        let expired = self
            .store
            .fail_expired_pending(self.config.command_max_age_secs)
            .await?;
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "expired undeliverable commands");
        }

        Ok(())
    }

    /// A conflict here means another actor finished the row first (e.g. the
    /// ack landed while we were deciding to retry), which is fine.
    fn ignore_conflict(&self, result: Result<(), DispatchError>) {
        match result {
            Ok(()) | Err(DispatchError::Conflict(_)) => {}
            Err(e) => tracing::error!(error = %e, "command state update failed"),
        }
    }
}
