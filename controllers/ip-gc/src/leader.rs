//! Leader election
//!
//! Every mutating GC action asks a [`LeaderGate`] first. [`LeaseLeaderGate`]
//! runs a `coordination.k8s.io/v1` Lease election; [`StaticLeader`] is used
//! when election is disabled and in tests.

use crate::backoff::FibonacciBackoff;
use crate::config::LeaderElectionConfig;
use crate::entry::to_utc;
use crate::error::ControllerError;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reports whether this replica may mutate cluster state.
pub trait LeaderGate: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Receives every change of leadership.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Leadership fixed by configuration, settable by tests.
#[derive(Debug)]
pub struct StaticLeader {
    state: watch::Sender<bool>,
}

impl StaticLeader {
    pub fn new(is_leader: bool) -> Self {
        Self {
            state: watch::Sender::new(is_leader),
        }
    }

    pub fn set(&self, is_leader: bool) {
        self.state.send_replace(is_leader);
    }
}

impl LeaderGate for StaticLeader {
    fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// What to do with the Lease after reading it.
#[derive(Debug, PartialEq, Eq)]
enum LeaseAction {
    /// We hold it; push `renewTime` forward.
    Renew,
    /// Free or expired; take it over.
    Acquire { transitions: i32 },
    /// Someone else holds a valid lease.
    Follow { holder: String },
}

fn next_action(lease: &Lease, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let spec = lease.spec.as_ref();
    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());

    match holder {
        Some(holder) if holder == identity => LeaseAction::Renew,
        Some(holder) => {
            let renewed = spec.and_then(|s| s.renew_time.as_ref()).and_then(to_utc);
            let duration = spec.and_then(|s| s.lease_duration_seconds).unwrap_or(0);
            match renewed {
                Some(renewed) if renewed + ChronoDuration::seconds(duration.into()) > now => LeaseAction::Follow {
                    holder: holder.to_string(),
                },
                _ => LeaseAction::Acquire {
                    transitions: transitions + 1,
                },
            }
        }
        None => LeaseAction::Acquire {
            transitions: transitions + 1,
        },
    }
}

fn micro_time(at: DateTime<Utc>) -> Option<MicroTime> {
    serde_json::from_value(json!(wire_time(at))).ok()
}

fn wire_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lease-based leader election.
pub struct LeaseLeaderGate {
    api: Api<Lease>,
    config: LeaderElectionConfig,
    state: watch::Sender<bool>,
}

impl std::fmt::Debug for LeaseLeaderGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLeaderGate")
            .field("lease", &self.config.lease_name)
            .field("identity", &self.config.identity)
            .field("leader", &*self.state.borrow())
            .finish()
    }
}

impl LeaseLeaderGate {
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.lease_namespace),
            config,
            state: watch::Sender::new(false),
        }
    }

    /// Runs the election until the token is cancelled, then gives the Lease up.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            lease = %self.config.lease_name,
            namespace = %self.config.lease_namespace,
            identity = %self.config.identity,
            "Starting leader election"
        );

        let mut last_renew: Option<Instant> = None;
        let mut backoff = FibonacciBackoff::new(1, self.config.lease_duration.as_secs().max(1));
        loop {
            let delay = match self.try_acquire_or_renew(Utc::now()).await {
                Ok(leader) => {
                    last_renew = leader.then(Instant::now);
                    backoff.reset();
                    self.publish(leader);
                    self.config.retry_period
                }
                Err(e) => {
                    warn!(lease = %self.config.lease_name, error = %e, "Failed to update lease");
                    if last_renew.is_some_and(|at| at.elapsed() >= self.config.renew_deadline) {
                        warn!("Lease not renewed within the renew deadline, stepping down");
                        last_renew = None;
                        self.publish(false);
                    }
                    if self.is_leader() {
                        self.config.retry_period
                    } else {
                        backoff.next_backoff()
                    }
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.is_leader() {
            self.publish(false);
            match self.release(Utc::now()).await {
                Ok(()) => info!(lease = %self.config.lease_name, "Released lease"),
                Err(e) => warn!(lease = %self.config.lease_name, error = %e, "Failed to release lease"),
            }
        }
    }

    fn publish(&self, leader: bool) {
        self.state.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            if leader {
                info!(identity = %self.config.identity, "Became leader");
            } else {
                warn!(identity = %self.config.identity, "Lost leadership");
            }
            *current = leader;
            true
        });
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, ControllerError> {
        let name = &self.config.lease_name;
        let Some(lease) = self.api.get_opt(name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(self.config.lease_namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_seconds()),
                    acquire_time: micro_time(now),
                    renew_time: micro_time(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            self.api.create(&PostParams::default(), &lease).await?;
            info!(lease = %name, "Created lease");
            return Ok(true);
        };

        let mut spec = json!({
            "holderIdentity": self.config.identity,
            "leaseDurationSeconds": self.lease_duration_seconds(),
            "renewTime": wire_time(now),
        });
        match next_action(&lease, &self.config.identity, now) {
            LeaseAction::Follow { holder } => {
                debug!(lease = %name, holder = %holder, "Lease held by another replica");
                return Ok(false);
            }
            LeaseAction::Renew => {}
            LeaseAction::Acquire { transitions } => {
                spec["acquireTime"] = json!(wire_time(now));
                spec["leaseTransitions"] = json!(transitions);
            }
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": spec,
        });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }

    async fn release(&self, now: DateTime<Utc>) -> Result<(), ControllerError> {
        let name = &self.config.lease_name;
        let Some(lease) = self.api.get_opt(name).await? else {
            return Ok(());
        };
        if next_action(&lease, &self.config.identity, now) != LeaseAction::Renew {
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": {
                "holderIdentity": "",
                "leaseDurationSeconds": 1,
                "renewTime": wire_time(now),
            }
        });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

impl LeaderGate for LeaseLeaderGate {
    fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn lease(holder: Option<&str>, renewed: Option<DateTime<Utc>>, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("ip-gc-controller".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                renew_time: renewed.and_then(micro_time),
                lease_duration_seconds: Some(duration),
                lease_transitions: Some(3),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_micro_time_round_trips_through_chrono() {
        let time = micro_time(now()).unwrap();
        assert_eq!(to_utc(&time), Some(now()));
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let l = lease(Some("me"), Some(now() - ChronoDuration::seconds(60)), 15);
        assert_eq!(next_action(&l, "me", now()), LeaseAction::Renew);
    }

    #[test]
    fn test_valid_foreign_lease_is_followed() {
        let l = lease(Some("other"), Some(now() - ChronoDuration::seconds(5)), 15);
        assert_eq!(
            next_action(&l, "me", now()),
            LeaseAction::Follow {
                holder: "other".to_string()
            }
        );
    }

    #[test]
    fn test_expired_or_free_lease_is_acquired() {
        let expired = lease(Some("other"), Some(now() - ChronoDuration::seconds(16)), 15);
        assert_eq!(next_action(&expired, "me", now()), LeaseAction::Acquire { transitions: 4 });

        let released = lease(Some(""), Some(now()), 1);
        assert_eq!(next_action(&released, "me", now()), LeaseAction::Acquire { transitions: 4 });

        let never_renewed = lease(Some("other"), None, 15);
        assert_eq!(next_action(&never_renewed, "me", now()), LeaseAction::Acquire { transitions: 4 });

        let empty = Lease::default();
        assert_eq!(next_action(&empty, "me", now()), LeaseAction::Acquire { transitions: 1 });
    }

    #[tokio::test]
    async fn test_static_leader_notifies_subscribers() {
        let gate = StaticLeader::new(false);
        let mut rx = gate.subscribe();
        assert!(!gate.is_leader());

        gate.set(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(gate.is_leader());
    }
}
