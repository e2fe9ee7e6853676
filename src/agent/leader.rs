use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::jiff::Timestamp as JiffTimestamp;
use kube::Api;
use kube::api::{Patch, PatchParams, PostParams};
use tokio::sync::watch;

use super::error::AgentError;

pub const LEASE_DURATION_SECS: i32 = 15;
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Cluster-lease-based active/standby election among agent replicas that
/// share one logical agent id. At most one replica holds the lease; the
/// holder keeps renewing, standbys poll until the holder misses its
/// renewal window.
pub struct LeaderElection {
    leases: Api<Lease>,
    lease_name: String,
    holder: String,
}

impl LeaderElection {
    pub fn new(client: kube::Client, namespace: &str, agent_id: &str, holder: String) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lease_name: lease_name(agent_id),
            holder,
        }
    }

    /// Block until this replica holds the lease.
    #[tracing::instrument(skip(self), fields(lease = %self.lease_name, holder = %self.holder))]
    pub async fn acquire(&self) -> Result<(), AgentError> {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    tracing::info!("lease acquired, this replica is the leader");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "lease attempt failed");
                }
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        match self.leases.get_opt(&self.lease_name).await? {
            None => match self
                .leases
                .create(&PostParams::default(), &self.build_lease(Utc::now(), 0))
                .await
            {
                Ok(_) => Ok(true),
                // Another replica created it between our get and create.
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            },
            Some(lease) => {
                let spec = lease.spec.unwrap_or_default();
                let current_holder = spec.holder_identity.as_deref().unwrap_or_default();

                if current_holder == self.holder {
                    self.renew().await?;
                    return Ok(true);
                }

                if !lease_expired(&spec, Utc::now()) {
                    return Ok(false);
                }

                // Holder missed its window; take over.
                let transitions = spec.lease_transitions.unwrap_or(0) + 1;
                let replacement = self.build_lease(Utc::now(), transitions);
                self.leases
                    .replace(&self.lease_name, &PostParams::default(), &Lease {
                        metadata: ObjectMeta {
                            name: Some(self.lease_name.clone()),
                            resource_version: lease.metadata.resource_version,
                            ..Default::default()
                        },
                        ..replacement
                    })
                    .await?;
                tracing::info!(previous = %current_holder, "lease taken over");
                Ok(true)
            }
        }
    }

    /// Push the renew time forward. Callers own the renewal cadence.
    pub async fn renew(&self) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.holder,
                "renewTime": MicroTime(to_jiff_timestamp(Utc::now())),
            }
        });
        self.leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Renewal loop for the current leader. Signals on `lost` and returns
    /// once renewals have failed for longer than the renew deadline; the
    /// caller must then drop its WebSocket and lifecycle work within one
    /// renew interval.
    pub async fn run_renewal(
        &self,
        lost: watch::Sender<bool>,
        mut shutdown: watch::Receiver<()>,
    ) {
        let mut last_success = std::time::Instant::now();
        let mut tick = tokio::time::interval(RETRY_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {
                    match self.renew().await {
                        Ok(()) => last_success = std::time::Instant::now(),
                        Err(e) => {
                            tracing::warn!(error = %e, "lease renewal failed");
                            if last_success.elapsed() > RENEW_DEADLINE {
                                tracing::error!("renew deadline exceeded, relinquishing leadership");
                                let _ = lost.send(true);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn build_lease(&self, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(lease_spec(&self.holder, now, transitions)),
        }
    }
}

fn to_jiff_timestamp(dt: DateTime<Utc>) -> JiffTimestamp {
    JiffTimestamp::new(dt.timestamp(), dt.timestamp_subsec_nanos() as i32)
        .expect("chrono DateTime<Utc> is always in jiff's representable range")
}

fn from_jiff_timestamp(ts: JiffTimestamp) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts.as_second(), ts.subsec_nanosecond() as u32)
        .expect("jiff Timestamp is always in chrono's representable range")
}

pub fn lease_name(agent_id: &str) -> String {
    format!("streamspace-agent-{agent_id}")
}

fn lease_spec(holder: &str, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(holder.to_owned()),
        lease_duration_seconds: Some(LEASE_DURATION_SECS),
        acquire_time: Some(MicroTime(to_jiff_timestamp(now))),
        renew_time: Some(MicroTime(to_jiff_timestamp(now))),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}

/// A lease is up for grabs once the holder's renew time plus the lease
/// duration is in the past. A lease without a renew time is malformed and
/// treated as expired.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renew_time) = &spec.renew_time else {
        return true;
    };
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS));
    from_jiff_timestamp(renew_time.0) + chrono::Duration::seconds(duration) < now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_name_embeds_agent_id() {
        assert_eq!(lease_name("k8s-prod-cluster"), "streamspace-agent-k8s-prod-cluster");
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        let now = Utc::now();
        let spec = lease_spec("replica-0", now, 0);
        assert!(!lease_expired(&spec, now));
        assert!(!lease_expired(&spec, now + chrono::Duration::seconds(14)));
    }

    #[test]
    fn lease_expires_after_duration() {
        let now = Utc::now();
        let spec = lease_spec("replica-0", now, 0);
        assert!(lease_expired(&spec, now + chrono::Duration::seconds(16)));
    }

    #[test]
    fn lease_without_renew_time_is_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("replica-0".into()),
            ..Default::default()
        };
        assert!(lease_expired(&spec, Utc::now()));
    }

    #[test]
    fn takeover_window_is_bounded() {
        // A standby polling every RETRY_PERIOD notices an expired lease at
        // most LEASE_DURATION + RETRY_PERIOD after the holder died.
        let worst_case = LEASE_DURATION_SECS as u64 + RETRY_PERIOD.as_secs();
        assert!(worst_case <= 20);
    }
}
