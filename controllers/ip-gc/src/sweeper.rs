//! Cluster sweeper: periodic reconciliation of every IPPool allocation
//!
//! The watcher only sees events it was around for. The sweeper walks every
//! allocation record in every pool and checks it against the live Pod and its
//! endpoint, so missed events and controller restarts still converge.

use crate::entry::{node_readiness, PodEntry, PodKey, TracingPolicy, TracingState};
use crate::health::LoopHeartbeat;
use crate::leader::LeaderGate;
use crate::release::{PoolIp, ReleaseKind, ReleaseRequest, ReleaseSender, ReleaseSource};
use crate::store::PodLivenessStore;
use chrono::{DateTime, Utc};
use crds::{PoolIPAllocation, WorkloadKind};
use ipam_gateway::{ClusterGateway, GatewayError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle for requesting an out-of-schedule sweep.
#[derive(Debug, Clone)]
pub struct SweepTrigger {
    tx: mpsc::Sender<()>,
}

impl SweepTrigger {
    /// Requests a sweep. Returns false when one is already pending.
    pub fn trigger(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Creates a debounced trigger: at most one request is ever pending.
pub fn sweep_trigger() -> (SweepTrigger, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (SweepTrigger { tx }, rx)
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub pools: usize,
    pub allocations: usize,
    /// Release requests enqueued
    pub released: usize,
    /// Allocations deliberately left alone (StatefulSet Pods being recreated)
    pub skipped: usize,
    pub errors: usize,
    /// Release requests dropped because the channel stayed full
    pub dropped: usize,
    /// The pass stopped early because leadership was lost
    pub aborted: bool,
    /// Untracked entries dropped because their Pod no longer exists
    pub pruned: usize,
}

/// What the sweeper decided about one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Live,
    Tracing,
    Released,
    Skipped,
    Dropped,
    /// The Pod is gone and this IP goes into its release request.
    Orphaned(PoolIp),
}

/// How an allocation whose Pod is gone is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrphanPolicy {
    ReleaseNow,
    /// The identity may come back with the same name; ask the StatefulSet first.
    VerifyStatefulIdentity,
}

fn orphan_policy(kind: &WorkloadKind, stateful_set_enabled: bool) -> OrphanPolicy {
    match kind {
        WorkloadKind::StatefulSet if stateful_set_enabled => OrphanPolicy::VerifyStatefulIdentity,
        WorkloadKind::StatefulSet => OrphanPolicy::ReleaseNow,
        WorkloadKind::Pod
        | WorkloadKind::Deployment
        | WorkloadKind::ReplicaSet
        | WorkloadKind::DaemonSet
        | WorkloadKind::Job
        | WorkloadKind::CronJob
        | WorkloadKind::Other(_) => OrphanPolicy::ReleaseNow,
    }
}

pub struct ClusterSweeper {
    gateway: Arc<dyn ClusterGateway>,
    store: Arc<PodLivenessStore>,
    leader: Arc<dyn LeaderGate>,
    releases: ReleaseSender,
    policy: TracingPolicy,
    stateful_set_enabled: bool,
    interval: Duration,
    heartbeat: Arc<LoopHeartbeat>,
}

impl ClusterSweeper {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        store: Arc<PodLivenessStore>,
        leader: Arc<dyn LeaderGate>,
        releases: ReleaseSender,
        policy: TracingPolicy,
        stateful_set_enabled: bool,
        interval: Duration,
    ) -> Self {
        Self {
            gateway,
            store,
            leader,
            releases,
            policy,
            stateful_set_enabled,
            interval,
            heartbeat: Arc::new(LoopHeartbeat::new("sweeper", interval)),
        }
    }

    pub fn heartbeat(&self) -> Arc<LoopHeartbeat> {
        self.heartbeat.clone()
    }

    /// One full pass over every pool.
    ///
    /// Orphaned Pods are collected first and each gets one release request
    /// carrying every IP it still holds. A pass that runs to completion ends by
    /// forgetting untracked Pods that no longer exist.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.leader.is_leader() {
            debug!("Not the leader, skipping sweep");
            return report;
        }

        let pools = match self.gateway.list_ip_pools().await {
            Ok(pools) => pools,
            Err(e) => {
                warn!(error = %e, "Failed to list IPPools, skipping sweep");
                report.errors += 1;
                return report;
            }
        };

        let mut seen = HashSet::new();
        let mut orphans: BTreeMap<PodKey, Vec<PoolIp>> = BTreeMap::new();
        for pool in pools {
            let Some(pool_name) = pool.metadata.name.clone() else {
                continue;
            };
            report.pools += 1;

            let allocations = match self.gateway.list_ips_allocated_in_pool(&pool_name).await {
                Ok(allocations) => allocations,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(pool = %pool_name, error = %e, "Failed to read IPPool allocations");
                    report.errors += 1;
                    continue;
                }
            };

            for (ip, record) in allocations {
                report.allocations += 1;
                if !self.leader.is_leader() {
                    warn!(pool = %pool_name, "Lost leadership, aborting sweep");
                    report.aborted = true;
                    return report;
                }

                let key = PodKey::new(&record.namespace, &record.pod_name);
                if let Some(targets) = orphans.get_mut(&key) {
                    targets.push(PoolIp {
                        pool: pool_name.clone(),
                        ip,
                        container_id: Some(record.container_id.clone()),
                    });
                    continue;
                }

                match self.check_allocation(&pool_name, &ip, &record, now, &mut seen).await {
                    Ok(Verdict::Orphaned(target)) => orphans.entry(key).or_default().push(target),
                    Ok(Verdict::Released) => report.released += 1,
                    Ok(Verdict::Skipped) => report.skipped += 1,
                    Ok(Verdict::Dropped) => report.dropped += 1,
                    Ok(Verdict::Live | Verdict::Tracing) => {}
                    Err(e) => {
                        warn!(
                            pool = %pool_name,
                            ip = %ip,
                            pod = %key,
                            error = %e,
                            "Failed to check allocation"
                        );
                        report.errors += 1;
                    }
                }
            }
        }

        for (key, targets) in orphans {
            info!(pod = %key, ips = targets.len(), "Pod is gone, releasing its IPs");
            match self
                .enqueue(&key.namespace, &key.name, ReleaseKind::Workload { fallbacks: targets })
                .await
            {
                Verdict::Released => {
                    self.store.mark_released(&key.namespace, &key.name);
                    report.released += 1;
                }
                Verdict::Dropped => report.dropped += 1,
                Verdict::Skipped => {
                    report.aborted = true;
                    return report;
                }
                Verdict::Live | Verdict::Tracing | Verdict::Orphaned(_) => {}
            }
        }

        report.pruned = self.prune_vanished(&seen).await;

        info!(
            pools = report.pools,
            allocations = report.allocations,
            released = report.released,
            skipped = report.skipped,
            errors = report.errors,
            pruned = report.pruned,
            "Sweep finished"
        );
        report
    }

    async fn check_allocation(
        &self,
        pool: &str,
        ip: &str,
        record: &PoolIPAllocation,
        now: DateTime<Utc>,
        seen: &mut HashSet<PodKey>,
    ) -> Result<Verdict, GatewayError> {
        let (namespace, pod_name) = (record.namespace.as_str(), record.pod_name.as_str());
        let target = PoolIp {
            pool: pool.to_string(),
            ip: ip.to_string(),
            container_id: Some(record.container_id.clone()),
        };

        let pod = match self.gateway.get_pod(namespace, pod_name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => return self.handle_missing_pod(record, target).await,
            Err(e) => return Err(e),
        };
        seen.insert(PodKey::new(namespace, pod_name));

        let node = node_readiness(self.gateway.as_ref(), &pod).await;
        let Some(observed) = PodEntry::observe(&pod, &self.policy, node, now) else {
            return Ok(Verdict::Live);
        };

        match observed.state {
            TracingState::Tracing { .. } => {
                let merged = match self.store.apply(observed.clone()) {
                    Ok(merged) => merged,
                    Err(e) => {
                        warn!(pod = %observed.key(), error = %e, "Cannot track pod, using observed deadline");
                        observed
                    }
                };
                match merged.state {
                    TracingState::Tracing { deadline, .. } if deadline <= now => {
                        let verdict = self
                            .enqueue(namespace, pod_name, ReleaseKind::Workload { fallbacks: vec![target] })
                            .await;
                        if verdict == Verdict::Released {
                            self.store.mark_released(namespace, pod_name);
                        }
                        Ok(verdict)
                    }
                    TracingState::Tracing { .. } => Ok(Verdict::Tracing),
                    TracingState::Released | TracingState::Untracked => Ok(Verdict::Live),
                }
            }
            TracingState::Untracked => {
                match self
                    .gateway
                    .check_current_container_id(namespace, pod_name, &record.container_id)
                    .await
                {
                    Ok(true) => Ok(Verdict::Live),
                    Ok(false) => {
                        info!(
                            pod = %format!("{}/{}", namespace, pod_name),
                            ip = %target,
                            container = %record.container_id,
                            "IP held by a container that is no longer current"
                        );
                        Ok(self.enqueue(namespace, pod_name, ReleaseKind::StaleIp(target)).await)
                    }
                    Err(e) if e.is_not_found() => Ok(Verdict::Live),
                    Err(e) => Err(e),
                }
            }
            TracingState::Released => Ok(Verdict::Live),
        }
    }

    async fn handle_missing_pod(&self, record: &PoolIPAllocation, target: PoolIp) -> Result<Verdict, GatewayError> {
        let (namespace, pod_name) = (record.namespace.as_str(), record.pod_name.as_str());
        let kind = record.owner_kind();

        match orphan_policy(&kind, self.stateful_set_enabled) {
            OrphanPolicy::VerifyStatefulIdentity => {
                if self.gateway.is_stateful_pod_pending(namespace, pod_name).await? {
                    debug!(
                        pod = %format!("{}/{}", namespace, pod_name),
                        ip = %target,
                        "StatefulSet pod is being recreated, keeping its IP"
                    );
                    return Ok(Verdict::Skipped);
                }
            }
            OrphanPolicy::ReleaseNow => {}
        }

        debug!(
            pod = %format!("{}/{}", namespace, pod_name),
            owner = %kind,
            ip = %target,
            "Allocation has no Pod"
        );
        Ok(Verdict::Orphaned(target))
    }

    /// Forgets untracked Pods that no longer exist. Pods found during this
    /// pass are not looked up again.
    async fn prune_vanished(&self, seen: &HashSet<PodKey>) -> usize {
        let mut pruned = 0;
        for entry in self.store.list() {
            let key = entry.key();
            if entry.state != TracingState::Untracked || seen.contains(&key) {
                continue;
            }
            match self.gateway.get_pod(&key.namespace, &key.name).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    if self.store.delete_untracked(&key.namespace, &key.name) {
                        debug!(pod = %key, "Pod is gone, forgetting it");
                        pruned += 1;
                    }
                }
                Err(e) => warn!(pod = %key, error = %e, "Failed to look up tracked pod"),
            }
        }
        pruned
    }

    async fn enqueue(&self, namespace: &str, pod_name: &str, kind: ReleaseKind) -> Verdict {
        if !self.leader.is_leader() {
            warn!(pod = %format!("{}/{}", namespace, pod_name), "Lost leadership, not enqueuing release");
            return Verdict::Skipped;
        }
        let request = ReleaseRequest {
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            kind,
            source: ReleaseSource::Sweeper,
        };
        match self.releases.dispatch(request).await {
            Ok(()) => Verdict::Released,
            Err(e) => {
                warn!(pod = %format!("{}/{}", namespace, pod_name), error = %e, "Dropped release signal");
                Verdict::Dropped
            }
        }
    }

    /// Sweeps on the interval, on manual triggers and whenever this replica
    /// becomes the leader.
    pub async fn run(&self, mut triggers: mpsc::Receiver<()>, token: CancellationToken) {
        info!(interval = ?self.interval, "Starting cluster sweeper");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut leadership = self.leader.subscribe();
        let mut leadership_open = true;
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Cluster sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
                trigger = triggers.recv(), if triggers_open => {
                    if trigger.is_none() {
                        triggers_open = false;
                        continue;
                    }
                    info!("Manual sweep requested");
                }
                changed = leadership.changed(), if leadership_open => {
                    if changed.is_err() {
                        leadership_open = false;
                        continue;
                    }
                    if !*leadership.borrow_and_update() {
                        continue;
                    }
                    info!("Elected leader, sweeping");
                }
            }

            let now = Utc::now();
            self.sweep_once(now).await;
            self.heartbeat.beat(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{TracingPolicy, TracingReason};
    use crate::release::release_channel;
    use crate::test_utils::{
        allocation, create_test_pod, create_test_wep, follower, leader, terminating_pod, with_phase, ExpiringLeader,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ipam_gateway::MockGateway;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        gateway: MockGateway,
        store: Arc<PodLivenessStore>,
        sweeper: ClusterSweeper,
        rx: mpsc::Receiver<ReleaseRequest>,
    }

    fn harness(gate: Arc<dyn LeaderGate>, stateful_set_enabled: bool) -> Harness {
        let gateway = MockGateway::new();
        let store = Arc::new(PodLivenessStore::new(100));
        let (sender, rx) = release_channel(64, Duration::from_millis(10));
        let sweeper = ClusterSweeper::new(
            Arc::new(gateway.clone()),
            store.clone(),
            gate,
            sender,
            TracingPolicy::default(),
            stateful_set_enabled,
            Duration::from_secs(600),
        );
        Harness {
            gateway,
            store,
            sweeper,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ReleaseRequest>) -> Vec<ReleaseRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    #[tokio::test]
    async fn test_orphan_without_pod_or_endpoint() {
        let mut h = harness(leader(), true);
        h.gateway.allocate("pool-a", "10.0.0.5", allocation("ns1", "p2", "c1", "Pod"));

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.released, 1);
        let requests = drain(&mut h.rx);
        assert_eq!(
            requests,
            vec![ReleaseRequest {
                namespace: "ns1".to_string(),
                pod_name: "p2".to_string(),
                kind: ReleaseKind::Workload {
                    fallbacks: vec![PoolIp {
                        pool: "pool-a".to_string(),
                        ip: "10.0.0.5".to_string(),
                        container_id: Some("c1".to_string()),
                    }],
                },
                source: ReleaseSource::Sweeper,
            }]
        );
    }

    #[tokio::test]
    async fn test_orphan_holding_several_ips_is_released_once() {
        let mut h = harness(leader(), true);
        h.gateway.allocate("pool-a", "10.0.0.5", allocation("ns1", "p2", "c1", "Pod"));
        h.gateway.allocate("pool-a", "10.0.0.6", allocation("ns1", "p2", "c1", "Pod"));
        h.gateway.allocate("pool-b", "10.1.0.5", allocation("ns1", "p2", "c1", "Pod"));

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.allocations, 3);
        assert_eq!(report.released, 1);
        let requests = drain(&mut h.rx);
        assert_eq!(requests.len(), 1);
        let ReleaseKind::Workload { fallbacks } = &requests[0].kind else {
            panic!("expected a workload release, got {:?}", requests[0].kind);
        };
        let ips: Vec<&str> = fallbacks.iter().map(|t| t.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.5", "10.0.0.6", "10.1.0.5"]);
    }

    #[tokio::test]
    async fn test_converges_on_orphans_only() {
        let mut h = harness(leader(), true);
        for i in 0..6 {
            let pod = format!("p{}", i);
            h.gateway.allocate("pool-a", &format!("10.0.0.{}", i), allocation("ns", &pod, "c1", "Deployment"));
            // Every third Pod is still running.
            if i % 3 == 0 {
                h.gateway.add_pod(create_test_pod("ns", &pod));
                h.gateway.add_wep(create_test_wep("ns", &pod, Some("c1"), &[("c1", "pool-a", "10.0.0.0")]));
            }
        }

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.allocations, 6);
        assert_eq!(report.released, 4);
        let mut pods: Vec<String> = drain(&mut h.rx).into_iter().map(|r| r.pod_name).collect();
        pods.sort();
        assert_eq!(pods, vec!["p1", "p2", "p4", "p5"]);
        // The sweeper itself never mutates the cluster.
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stateful_pod_being_recreated_is_skipped() {
        let mut h = harness(leader(), true);
        h.gateway.allocate("pool-a", "10.0.0.8", allocation("db", "db-0", "c1", "StatefulSet"));
        h.gateway.set_stateful_pending("db", "db-0");

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.skipped, 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_stateful_protection_can_be_disabled() {
        let mut h = harness(leader(), false);
        h.gateway.allocate("pool-a", "10.0.0.8", allocation("db", "db-0", "c1", "StatefulSet"));
        h.gateway.set_stateful_pending("db", "db-0");

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.released, 1);
        assert_eq!(drain(&mut h.rx).len(), 1);
    }

    #[tokio::test]
    async fn test_container_mismatch_releases_only_that_ip() {
        let mut h = harness(leader(), true);
        h.gateway.add_pod(create_test_pod("ns", "p1"));
        h.gateway.allocate("pool-a", "10.0.0.7", allocation("ns", "p1", "old", "Deployment"));
        h.gateway.add_wep(create_test_wep("ns", "p1", Some("new"), &[("old", "pool-a", "10.0.0.7")]));

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.released, 1);
        let requests = drain(&mut h.rx);
        assert_eq!(requests.len(), 1);
        assert!(matches!(&requests[0].kind, ReleaseKind::StaleIp(target) if target.ip == "10.0.0.7"));
    }

    #[tokio::test]
    async fn test_running_pod_without_endpoint_is_kept() {
        let mut h = harness(leader(), true);
        h.gateway.add_pod(create_test_pod("ns", "p1"));
        h.gateway.allocate("pool-a", "10.0.0.7", allocation("ns", "p1", "c1", "Deployment"));

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.released, 0);
        assert_eq!(report.errors, 0);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_terminating_pod_is_tracked_until_deadline() {
        let mut h = harness(leader(), true);
        h.gateway.add_pod(terminating_pod("ns", "p1", t0(), 30));
        h.gateway.allocate("pool-a", "10.0.0.4", allocation("ns", "p1", "c1", "Deployment"));

        let early = h.sweeper.sweep_once(t0() + ChronoDuration::seconds(10)).await;
        assert_eq!(early.released, 0);
        let tracked = h.store.get("ns", "p1").unwrap();
        assert_eq!(
            tracked.state,
            TracingState::Tracing {
                reason: TracingReason::Terminating,
                deadline: t0() + ChronoDuration::seconds(30),
            }
        );

        let due = h.sweeper.sweep_once(t0() + ChronoDuration::seconds(31)).await;
        assert_eq!(due.released, 1);
        assert_eq!(h.store.get("ns", "p1").unwrap().state, TracingState::Released);
        assert_eq!(drain(&mut h.rx).len(), 1);

        // A released entry is not enqueued again.
        let again = h.sweeper.sweep_once(t0() + ChronoDuration::seconds(32)).await;
        assert_eq!(again.released, 0);
    }

    #[tokio::test]
    async fn test_completed_pod_waits_for_additional_delay() {
        let mut h = harness(leader(), true);
        h.gateway.add_pod(with_phase(create_test_pod("ns", "job-1"), "Succeeded"));
        h.gateway.allocate("pool-a", "10.0.0.9", allocation("ns", "job-1", "c1", "Job"));

        assert_eq!(h.sweeper.sweep_once(t0()).await.released, 0);
        assert_eq!(h.sweeper.sweep_once(t0() + ChronoDuration::seconds(5)).await.released, 1);
        assert_eq!(drain(&mut h.rx).len(), 1);
    }

    #[tokio::test]
    async fn test_follower_does_not_sweep() {
        let mut h = harness(follower(), true);
        h.gateway.allocate("pool-a", "10.0.0.5", allocation("ns1", "p2", "c1", "Pod"));

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report, SweepReport::default());
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn test_untracked_pod_that_vanished_is_forgotten() {
        let h = harness(leader(), true);
        // Running pods seen by the watcher; p1 was deleted while the watch
        // was relisting, so no delete event arrived.
        h.store.create(PodEntry::new("ns", "p1", t0())).unwrap();
        h.store.create(PodEntry::new("ns", "p2", t0())).unwrap();
        h.gateway.add_pod(create_test_pod("ns", "p2"));
        // Tracing entries are left to the tracer.
        let mut terminating = PodEntry::new("ns", "p3", t0());
        terminating.transition(TracingState::Tracing {
            reason: TracingReason::Terminating,
            deadline: t0() + ChronoDuration::seconds(30),
        });
        h.store.create(terminating).unwrap();

        let report = h.sweeper.sweep_once(t0()).await;

        assert_eq!(report.pruned, 1);
        let names: Vec<String> = h.store.list().into_iter().map(|e| e.pod_name).collect();
        assert_eq!(names, vec!["p2", "p3"]);

        // Nothing left to prune on the next pass.
        assert_eq!(h.sweeper.sweep_once(t0() + ChronoDuration::hours(1)).await.pruned, 0);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn test_full_store_recovers_once_vanished_pods_are_forgotten() {
        let gateway = MockGateway::new();
        let store = Arc::new(PodLivenessStore::new(2));
        let (sender, _rx) = release_channel(8, Duration::from_millis(10));
        let sweeper = ClusterSweeper::new(
            Arc::new(gateway.clone()),
            store.clone(),
            leader(),
            sender,
            TracingPolicy::default(),
            true,
            Duration::from_secs(600),
        );
        store.create(PodEntry::new("ns", "gone-1", t0())).unwrap();
        store.create(PodEntry::new("ns", "gone-2", t0())).unwrap();
        assert!(store.create(PodEntry::new("ns", "new", t0())).is_err());

        assert_eq!(sweeper.sweep_once(t0()).await.pruned, 2);
        assert!(store.create(PodEntry::new("ns", "new", t0())).is_ok());
    }

    #[tokio::test]
    async fn test_leadership_lost_between_allocations_aborts() {
        // Granted for the pass itself and the first allocation only.
        let mut h = harness(ExpiringLeader::after(2), true);
        h.gateway.allocate("pool-a", "10.0.0.1", allocation("ns", "p1", "c1", "Pod"));
        h.gateway.allocate("pool-a", "10.0.0.2", allocation("ns", "p2", "c1", "Pod"));
        h.store.create(PodEntry::new("ns", "gone", t0())).unwrap();

        let report = h.sweeper.sweep_once(t0()).await;

        assert!(report.aborted);
        assert_eq!(report.released, 0);
        assert!(drain(&mut h.rx).is_empty());
        // An aborted pass does not prune.
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_leadership_lost_while_enqueuing_stops_after_first_request() {
        // Granted for the pass, both allocations and the first enqueue.
        let mut h = harness(ExpiringLeader::after(4), true);
        h.gateway.allocate("pool-a", "10.0.0.1", allocation("ns", "p1", "c1", "Pod"));
        h.gateway.allocate("pool-a", "10.0.0.2", allocation("ns", "p2", "c1", "Pod"));

        let report = h.sweeper.sweep_once(t0()).await;

        assert!(report.aborted);
        assert_eq!(report.released, 1);
        let requests = drain(&mut h.rx);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].pod_name, "p1");
        assert!(h.gateway.calls().is_empty());
    }

    #[test]
    fn test_orphan_policy_per_kind() {
        assert_eq!(
            orphan_policy(&WorkloadKind::StatefulSet, true),
            OrphanPolicy::VerifyStatefulIdentity
        );
        assert_eq!(orphan_policy(&WorkloadKind::StatefulSet, false), OrphanPolicy::ReleaseNow);
        for kind in [
            WorkloadKind::Pod,
            WorkloadKind::Deployment,
            WorkloadKind::Job,
            WorkloadKind::Other("VirtualMachine".to_string()),
        ] {
            assert_eq!(orphan_policy(&kind, true), OrphanPolicy::ReleaseNow);
        }
    }

    #[tokio::test]
    async fn test_trigger_is_debounced() {
        let (trigger, mut rx) = sweep_trigger();
        assert!(trigger.trigger());
        assert!(!trigger.trigger());

        rx.recv().await.unwrap();
        assert!(trigger.trigger());
    }
}
