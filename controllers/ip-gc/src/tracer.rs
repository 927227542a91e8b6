//! Tracer: releases tracked Pods once their grace period has elapsed

use crate::entry::{PodEntry, TracingReason, TracingState};
use crate::health::LoopHeartbeat;
use crate::leader::LeaderGate;
use crate::release::{ReleaseKind, ReleaseRequest, ReleaseSender, ReleaseSource};
use crate::store::{PodLivenessStore, StoreError};
use chrono::{DateTime, Utc};
use ipam_gateway::HistoricalIps;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one tracer pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub dispatched: usize,
    pub pending: usize,
    pub dropped: usize,
    pub malformed: usize,
    pub purged: usize,
    pub skipped_not_leader: bool,
}

pub struct Tracer {
    store: Arc<PodLivenessStore>,
    releases: ReleaseSender,
    leader: Arc<dyn LeaderGate>,
    interval: Duration,
    heartbeat: Arc<LoopHeartbeat>,
}

impl Tracer {
    pub fn new(
        store: Arc<PodLivenessStore>,
        releases: ReleaseSender,
        leader: Arc<dyn LeaderGate>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            releases,
            leader,
            interval,
            heartbeat: Arc::new(LoopHeartbeat::new("tracer", interval)),
        }
    }

    pub fn heartbeat(&self) -> Arc<LoopHeartbeat> {
        self.heartbeat.clone()
    }

    /// Starts (or keeps) tracing `entry` for the IPs in `history` and stores it.
    ///
    /// An untracked entry starts tracing with reason `Unknown` and a deadline
    /// of `now`; an existing deadline is kept.
    pub fn track(&self, mut entry: PodEntry, history: &HistoricalIps, now: DateTime<Utc>) -> Result<PodEntry, StoreError> {
        let (reason, deadline) = match &entry.state {
            TracingState::Tracing { reason, deadline } => (*reason, *deadline),
            TracingState::Untracked | TracingState::Released => (TracingReason::Unknown, now),
        };
        entry.trace(reason, deadline, history);
        let tracked = self.store.apply(entry)?;
        debug!(
            pod = %tracked.key(),
            deadline = ?tracked.state.deadline(),
            ips = tracked.traced_ips.len(),
            "Tracing pod"
        );
        Ok(tracked)
    }

    /// One pass over the store.
    pub async fn trace_once(&self, now: DateTime<Utc>) -> TraceReport {
        let mut report = TraceReport::default();
        if !self.leader.is_leader() {
            debug!("Not the leader, skipping trace pass");
            report.skipped_not_leader = true;
            return report;
        }

        for entry in self.store.list() {
            let deadline = match entry.state {
                TracingState::Untracked => continue,
                TracingState::Released => {
                    self.store.delete(&entry.namespace, &entry.pod_name);
                    report.purged += 1;
                    continue;
                }
                TracingState::Tracing { deadline, .. } => deadline,
            };

            if deadline == DateTime::<Utc>::UNIX_EPOCH {
                warn!(pod = %entry.key(), "Tracing entry has no deadline, skipping");
                report.malformed += 1;
                continue;
            }
            if now < deadline {
                report.pending += 1;
                continue;
            }
            // Leadership may change between entries.
            if !self.leader.is_leader() {
                warn!("Lost leadership during trace pass");
                report.skipped_not_leader = true;
                break;
            }

            let request = ReleaseRequest {
                namespace: entry.namespace.clone(),
                pod_name: entry.pod_name.clone(),
                kind: ReleaseKind::Workload { fallbacks: Vec::new() },
                source: ReleaseSource::Tracer,
            };
            match self.releases.dispatch(request).await {
                Ok(()) => {
                    info!(pod = %entry.key(), deadline = %deadline, "Grace period elapsed, releasing IPs");
                    self.store.delete(&entry.namespace, &entry.pod_name);
                    report.dispatched += 1;
                }
                Err(e) => {
                    warn!(pod = %entry.key(), error = %e, "Dropped release signal, will retry next pass");
                    report.dropped += 1;
                }
            }
        }

        if report.dispatched > 0 || report.dropped > 0 {
            info!(
                dispatched = report.dispatched,
                dropped = report.dropped,
                pending = report.pending,
                "Trace pass finished"
            );
        }
        report
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(interval = ?self.interval, "Starting tracer");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Tracer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    self.trace_once(now).await;
                    self.heartbeat.beat(now);
                }
            }
        }
    }
}
