//! Release requests and the worker pool that executes them
//!
//! Producers (the tracer and the sweeper) hand requests to a bounded channel
//! through a [`ReleaseSender`]; a fixed number of workers drain it. The
//! workers are the only part of the engine that mutates `IPPool` and
//! `WorkloadEndpoint` resources.

use crate::leader::LeaderGate;
use ipam_gateway::{ClusterGateway, GatewayError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One allocated IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolIp {
    pub pool: String,
    pub ip: String,
    /// Only release the record while it still belongs to this container.
    pub container_id: Option<String>,
}

impl fmt::Display for PoolIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.ip)
    }
}

/// What a request releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseKind {
    /// Every IP in the endpoint history plus `fallbacks`, then the GC
    /// finalizer. Only `fallbacks` are released when the endpoint no longer
    /// exists.
    Workload { fallbacks: Vec<PoolIp> },
    /// A single IP held by a container that is no longer current.
    StaleIp(PoolIp),
}

/// Which loop produced a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseSource {
    Tracer,
    Sweeper,
}

impl fmt::Display for ReleaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracer => f.write_str("tracer"),
            Self::Sweeper => f.write_str("sweeper"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub namespace: String,
    pub pod_name: String,
    pub kind: ReleaseKind,
    pub source: ReleaseSource,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("release channel stayed full for {0:?}")]
    Timeout(Duration),

    #[error("release channel is closed")]
    Closed,
}

/// Producer side of the release channel.
#[derive(Debug, Clone)]
pub struct ReleaseSender {
    tx: mpsc::Sender<ReleaseRequest>,
    timeout: Duration,
}

impl ReleaseSender {
    /// Enqueues a request, giving up after the configured timeout.
    pub async fn dispatch(&self, request: ReleaseRequest) -> Result<(), DispatchError> {
        match self.tx.send_timeout(request, self.timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(DispatchError::Timeout(self.timeout)),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

/// Creates the bounded release channel.
pub fn release_channel(capacity: usize, timeout: Duration) -> (ReleaseSender, mpsc::Receiver<ReleaseRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ReleaseSender { tx, timeout }, rx)
}

/// Counts of what one request did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub released: usize,
    /// Records that were already gone or now belong to another container.
    pub already_gone: usize,
    pub failed: usize,
    pub finalizer_removed: bool,
    /// Dropped because this replica is not the leader.
    pub skipped: bool,
}

/// Executes one release request against the cluster.
pub struct ReleaseExecutor {
    gateway: Arc<dyn ClusterGateway>,
    leader: Arc<dyn LeaderGate>,
}

impl ReleaseExecutor {
    pub fn new(gateway: Arc<dyn ClusterGateway>, leader: Arc<dyn LeaderGate>) -> Self {
        Self { gateway, leader }
    }

    fn still_leader(&self, request: &ReleaseRequest, outcome: &mut ReleaseOutcome) -> bool {
        if self.leader.is_leader() {
            return true;
        }
        warn!(
            pod = %format!("{}/{}", request.namespace, request.pod_name),
            source = %request.source,
            "Not the leader, dropping release request"
        );
        outcome.skipped = true;
        false
    }

    pub async fn process(&self, request: &ReleaseRequest) -> ReleaseOutcome {
        let mut outcome = ReleaseOutcome::default();
        if !self.still_leader(request, &mut outcome) {
            return outcome;
        }

        match &request.kind {
            ReleaseKind::StaleIp(target) => {
                info!(
                    pod = %format!("{}/{}", request.namespace, request.pod_name),
                    ip = %target,
                    "Releasing IP of a stale container"
                );
                self.release_one(target, &mut outcome).await;
            }
            ReleaseKind::Workload { fallbacks } => self.release_workload(request, fallbacks, &mut outcome).await,
        }

        debug!(
            pod = %format!("{}/{}", request.namespace, request.pod_name),
            released = outcome.released,
            already_gone = outcome.already_gone,
            failed = outcome.failed,
            "Release request processed"
        );
        outcome
    }

    async fn release_workload(&self, request: &ReleaseRequest, fallbacks: &[PoolIp], outcome: &mut ReleaseOutcome) {
        let (namespace, pod) = (request.namespace.as_str(), request.pod_name.as_str());

        let history = match self.gateway.list_historical_ips(namespace, pod).await {
            Ok(history) => history,
            Err(e) if e.is_not_found() => {
                if fallbacks.is_empty() {
                    debug!(pod = %format!("{}/{}", namespace, pod), "Endpoint gone, nothing to release");
                    return;
                }
                info!(
                    pod = %format!("{}/{}", namespace, pod),
                    ips = fallbacks.len(),
                    "Endpoint gone, releasing recorded IPs"
                );
                for target in fallbacks {
                    if !self.still_leader(request, outcome) {
                        return;
                    }
                    self.release_one(target, outcome).await;
                }
                return;
            }
            Err(e) => {
                error!(
                    pod = %format!("{}/{}", namespace, pod),
                    error = %e,
                    "Failed to read endpoint history, leaving release to the next sweep"
                );
                outcome.failed += 1;
                return;
            }
        };

        let mut targets: Vec<PoolIp> = history
            .into_iter()
            .flat_map(|(pool, ips)| {
                ips.into_iter().map(move |h| PoolIp {
                    pool: pool.clone(),
                    ip: h.ip,
                    container_id: Some(h.container_id),
                })
            })
            .collect();
        for target in fallbacks {
            if !targets.iter().any(|t| t.pool == target.pool && t.ip == target.ip) {
                targets.push(target.clone());
            }
        }

        info!(
            pod = %format!("{}/{}", namespace, pod),
            source = %request.source,
            ips = targets.len(),
            "Releasing workload IPs"
        );
        for target in &targets {
            if !self.still_leader(request, outcome) {
                return;
            }
            self.release_one(target, outcome).await;
        }

        if !self.still_leader(request, outcome) {
            return;
        }
        match self.gateway.remove_finalizer(namespace, pod).await {
            Ok(()) => outcome.finalizer_removed = true,
            Err(e) => warn!(pod = %format!("{}/{}", namespace, pod), error = %e, "Failed to remove GC finalizer"),
        }
    }

    async fn release_one(&self, target: &PoolIp, outcome: &mut ReleaseOutcome) {
        match self
            .gateway
            .release_ip(&target.pool, &target.ip, target.container_id.as_deref())
            .await
        {
            Ok(()) => outcome.released += 1,
            Err(GatewayError::NotFound(reason)) => {
                debug!(ip = %target, reason = %reason, "IP already released");
                outcome.already_gone += 1;
            }
            Err(e) => {
                error!(ip = %target, error = %e, "Failed to release IP");
                outcome.failed += 1;
            }
        }
    }
}

/// Fixed-size pool of release workers sharing one receiver.
pub struct ReleaseExecutorPool {
    executor: Arc<ReleaseExecutor>,
    workers: usize,
}

impl ReleaseExecutorPool {
    pub fn new(executor: Arc<ReleaseExecutor>, workers: usize) -> Self {
        Self { executor, workers }
    }

    /// Spawns the workers. They exit when the token is cancelled or every
    /// sender is gone.
    pub fn spawn(self, rx: mpsc::Receiver<ReleaseRequest>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..self.workers)
            .map(|worker| {
                let rx = rx.clone();
                let executor = self.executor.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    debug!(worker, "Release worker started");
                    loop {
                        let next = tokio::select! {
                            _ = token.cancelled() => None,
                            request = async { rx.lock().await.recv().await } => request,
                        };
                        let Some(request) = next else {
                            break;
                        };
                        executor.process(&request).await;
                    }
                    debug!(worker, "Release worker stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{allocation, create_test_wep, follower, leader, ExpiringLeader};
    use ipam_gateway::MockGateway;

    fn workload(namespace: &str, pod: &str, fallbacks: Vec<PoolIp>) -> ReleaseRequest {
        ReleaseRequest {
            namespace: namespace.to_string(),
            pod_name: pod.to_string(),
            kind: ReleaseKind::Workload { fallbacks },
            source: ReleaseSource::Tracer,
        }
    }

    fn pool_ip(pool: &str, ip: &str, container_id: &str) -> PoolIp {
        PoolIp {
            pool: pool.to_string(),
            ip: ip.to_string(),
            container_id: Some(container_id.to_string()),
        }
    }

    fn executor(gateway: &MockGateway, gate: Arc<dyn LeaderGate>) -> ReleaseExecutor {
        ReleaseExecutor::new(Arc::new(gateway.clone()), gate)
    }

    #[tokio::test]
    async fn test_workload_release_covers_history_and_finalizer() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.4", allocation("ns", "p1", "c1", "Deployment"));
        gateway.allocate("pool-b", "10.1.0.4", allocation("ns", "p1", "c1", "Deployment"));
        gateway.add_wep(create_test_wep(
            "ns",
            "p1",
            Some("c1"),
            &[("c1", "pool-a", "10.0.0.4"), ("c1", "pool-b", "10.1.0.4")],
        ));

        let outcome = executor(&gateway, leader()).process(&workload("ns", "p1", Vec::new())).await;

        assert_eq!(outcome.released, 2);
        assert!(outcome.finalizer_removed);
        assert!(gateway.allocation("pool-a", "10.0.0.4").is_none());
        assert!(gateway.allocation("pool-b", "10.1.0.4").is_none());
        assert_eq!(gateway.finalizer_calls(), vec!["ns/p1".to_string()]);
    }

    #[tokio::test]
    async fn test_already_released_ip_is_success() {
        let gateway = MockGateway::new();
        gateway.add_pool("pool-a", "10.0.0.0/24");
        gateway.add_wep(create_test_wep("ns", "p1", None, &[("c1", "pool-a", "10.0.0.4")]));

        let outcome = executor(&gateway, leader()).process(&workload("ns", "p1", Vec::new())).await;

        assert_eq!(outcome.released, 0);
        assert_eq!(outcome.already_gone, 1);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.finalizer_removed);
    }

    #[tokio::test]
    async fn test_missing_endpoint_releases_fallback() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.5", allocation("ns1", "p2", "c9", "Pod"));

        let outcome = executor(&gateway, leader())
            .process(&workload("ns1", "p2", vec![pool_ip("pool-a", "10.0.0.5", "c9")]))
            .await;

        assert_eq!(outcome.released, 1);
        assert!(!outcome.finalizer_removed);
        assert_eq!(gateway.release_calls(), vec![("pool-a".to_string(), "10.0.0.5".to_string())]);
        assert!(gateway.finalizer_calls().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_rest() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.4", allocation("ns", "p1", "c1", "Pod"));
        gateway.allocate("pool-a", "10.0.0.6", allocation("ns", "p1", "c1", "Pod"));
        gateway.add_wep(create_test_wep(
            "ns",
            "p1",
            None,
            &[("c1", "pool-a", "10.0.0.4"), ("c1", "pool-a", "10.0.0.6")],
        ));
        gateway.fail_release_of("10.0.0.4");

        let outcome = executor(&gateway, leader()).process(&workload("ns", "p1", Vec::new())).await;

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.released, 1);
        assert!(outcome.finalizer_removed);
        assert!(gateway.allocation("pool-a", "10.0.0.6").is_none());
    }

    #[tokio::test]
    async fn test_stale_ip_release_leaves_finalizer() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.7", allocation("ns", "p1", "old", "Deployment"));
        gateway.add_wep(create_test_wep("ns", "p1", Some("new"), &[("old", "pool-a", "10.0.0.7")]));

        let request = ReleaseRequest {
            namespace: "ns".to_string(),
            pod_name: "p1".to_string(),
            kind: ReleaseKind::StaleIp(pool_ip("pool-a", "10.0.0.7", "old")),
            source: ReleaseSource::Sweeper,
        };
        let outcome = executor(&gateway, leader()).process(&request).await;

        assert_eq!(outcome.released, 1);
        assert!(gateway.finalizer_calls().is_empty());
        assert!(gateway.wep("ns", "p1").unwrap().has_gc_finalizer());
    }

    #[tokio::test]
    async fn test_follower_mutates_nothing() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.4", allocation("ns", "p1", "c1", "Pod"));
        gateway.add_wep(create_test_wep("ns", "p1", None, &[("c1", "pool-a", "10.0.0.4")]));

        let outcome = executor(&gateway, follower()).process(&workload("ns", "p1", Vec::new())).await;

        assert!(outcome.skipped);
        assert!(gateway.calls().is_empty());
        assert!(gateway.allocation("pool-a", "10.0.0.4").is_some());
    }

    #[tokio::test]
    async fn test_leadership_lost_mid_request_stops_mutations() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.4", allocation("ns", "p1", "c1", "Pod"));
        gateway.allocate("pool-a", "10.0.0.6", allocation("ns", "p1", "c1", "Pod"));
        gateway.add_wep(create_test_wep(
            "ns",
            "p1",
            None,
            &[("c1", "pool-a", "10.0.0.4"), ("c1", "pool-a", "10.0.0.6")],
        ));

        // Granted for the request and the first release only.
        let outcome = executor(&gateway, ExpiringLeader::after(2))
            .process(&workload("ns", "p1", Vec::new()))
            .await;

        assert!(outcome.skipped);
        assert_eq!(outcome.released, 1);
        assert!(!outcome.finalizer_removed);
        assert_eq!(gateway.release_calls().len(), 1);
        assert!(gateway.finalizer_calls().is_empty());
        assert!(gateway.wep("ns", "p1").unwrap().has_gc_finalizer());
    }

    #[tokio::test]
    async fn test_missing_endpoint_releases_every_fallback() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.5", allocation("ns1", "p2", "c9", "Pod"));
        gateway.allocate("pool-b", "10.1.0.5", allocation("ns1", "p2", "c9", "Pod"));

        let fallbacks = vec![pool_ip("pool-a", "10.0.0.5", "c9"), pool_ip("pool-b", "10.1.0.5", "c9")];
        let outcome = executor(&gateway, leader()).process(&workload("ns1", "p2", fallbacks)).await;

        assert_eq!(outcome.released, 2);
        assert!(gateway.allocation("pool-a", "10.0.0.5").is_none());
        assert!(gateway.allocation("pool-b", "10.1.0.5").is_none());
        assert!(gateway.finalizer_calls().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_read_error_abandons_request() {
        let gateway = MockGateway::new();
        gateway.allocate("pool-a", "10.0.0.5", allocation("ns", "p1", "c1", "Pod"));
        gateway.fail_wep_reads(true);

        let outcome = executor(&gateway, leader())
            .process(&workload("ns", "p1", vec![pool_ip("pool-a", "10.0.0.5", "c1")]))
            .await;

        assert_eq!(outcome.failed, 1);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_times_out_when_full() {
        let (sender, _rx) = release_channel(1, Duration::from_millis(10));
        sender.dispatch(workload("ns", "p1", Vec::new())).await.unwrap();

        assert_eq!(
            sender.dispatch(workload("ns", "p2", Vec::new())).await,
            Err(DispatchError::Timeout(Duration::from_millis(10)))
        );
    }

    #[tokio::test]
    async fn test_dispatch_fails_when_closed() {
        let (sender, rx) = release_channel(1, Duration::from_millis(10));
        drop(rx);

        assert_eq!(sender.dispatch(workload("ns", "p1", Vec::new())).await, Err(DispatchError::Closed));
    }

    #[tokio::test]
    async fn test_pool_drains_channel() {
        let gateway = MockGateway::new();
        for i in 0..5 {
            let pod = format!("p{}", i);
            gateway.allocate("pool-a", &format!("10.0.0.{}", i), allocation("ns", &pod, "c1", "Pod"));
        }

        let (sender, rx) = release_channel(16, Duration::from_secs(1));
        let token = CancellationToken::new();
        let handles = ReleaseExecutorPool::new(Arc::new(executor(&gateway, leader())), 3).spawn(rx, token.clone());
        for i in 0..5 {
            let pod = format!("p{}", i);
            let fallback = pool_ip("pool-a", &format!("10.0.0.{}", i), "c1");
            sender.dispatch(workload("ns", &pod, vec![fallback])).await.unwrap();
        }
        drop(sender);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(gateway.release_calls().len(), 5);
        assert!(gateway.list_ips_allocated_in_pool("pool-a").await.unwrap().is_empty());
    }
}
