//! Mock ClusterGateway for unit testing
//!
//! Stores every resource in memory and records each mutating call so tests
//! can assert on exactly what the GC engine asked the cluster to do.

use crate::error::GatewayError;
use crate::gateway_trait::ClusterGateway;
use crate::models::{group_history, HistoricalIps};
use crds::{IPPool, IPPoolSpec, IPPoolStatus, PoolIPAllocation, WorkloadEndpoint, IP_GC_FINALIZER};
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// A mutating call issued against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    ReleaseIp { pool: String, ip: String },
    RemoveFinalizer { namespace: String, name: String },
}

/// Mock gateway for testing
#[derive(Clone, Default, Debug)]
pub struct MockGateway {
    pub(crate) pods: Arc<Mutex<HashMap<Key, Pod>>>,
    pub(crate) nodes: Arc<Mutex<HashMap<String, bool>>>,
    pub(crate) pools: Arc<Mutex<BTreeMap<String, IPPool>>>,
    pub(crate) weps: Arc<Mutex<HashMap<Key, WorkloadEndpoint>>>,
    pub(crate) stateful_pending: Arc<Mutex<HashSet<Key>>>,
    // Failure injection
    pub(crate) failing_releases: Arc<Mutex<HashSet<String>>>,
    pub(crate) failing_wep_reads: Arc<Mutex<bool>>,
    pub(crate) calls: Arc<Mutex<Vec<GatewayCall>>>,
}

impl MockGateway {
    /// Create an empty mock gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a Pod (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().unwrap().insert((namespace, name), pod);
    }

    /// Remove a Pod (for test setup)
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods.lock().unwrap().remove(&key(namespace, name));
    }

    /// Set a node's readiness (for test setup)
    pub fn set_node_ready(&self, name: &str, ready: bool) {
        self.nodes.lock().unwrap().insert(name.to_string(), ready);
    }

    /// Add an empty pool (for test setup)
    pub fn add_pool(&self, name: &str, subnet: &str) {
        let mut pool = IPPool::new(name, IPPoolSpec {
            subnet: subnet.to_string(),
            ..Default::default()
        });
        pool.status = Some(IPPoolStatus::default());
        self.pools.lock().unwrap().insert(name.to_string(), pool);
    }

    /// Record an allocation in a pool, creating the pool if needed (for test setup)
    pub fn allocate(&self, pool: &str, ip: &str, allocation: PoolIPAllocation) {
        if !self.pools.lock().unwrap().contains_key(pool) {
            self.add_pool(pool, "");
        }
        let mut pools = self.pools.lock().unwrap();
        if let Some(status) = pools.get_mut(pool).and_then(|p| p.status.as_mut()) {
            status.allocated_ips.insert(ip.to_string(), allocation);
            status.allocated_ip_count = status.allocated_ips.len() as u64;
        }
    }

    /// Current allocation record for an IP
    pub fn allocation(&self, pool: &str, ip: &str) -> Option<PoolIPAllocation> {
        self.pools
            .lock()
            .unwrap()
            .get(pool)
            .and_then(|p| p.allocations().get(ip).cloned())
    }

    /// Add or replace a WorkloadEndpoint (for test setup)
    pub fn add_wep(&self, wep: WorkloadEndpoint) {
        let namespace = wep.metadata.namespace.clone().unwrap_or_default();
        let name = wep.metadata.name.clone().unwrap_or_default();
        self.weps.lock().unwrap().insert((namespace, name), wep);
    }

    /// Stored WorkloadEndpoint, if any
    pub fn wep(&self, namespace: &str, name: &str) -> Option<WorkloadEndpoint> {
        self.weps.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Mark a missing StatefulSet Pod as still wanted by its StatefulSet
    pub fn set_stateful_pending(&self, namespace: &str, name: &str) {
        self.stateful_pending.lock().unwrap().insert(key(namespace, name));
    }

    /// Make every release of `ip` fail with an API error
    pub fn fail_release_of(&self, ip: &str) {
        self.failing_releases.lock().unwrap().insert(ip.to_string());
    }

    /// Make every endpoint read fail with an API error
    pub fn fail_wep_reads(&self, fail: bool) {
        *self.failing_wep_reads.lock().unwrap() = fail;
    }

    /// All mutating calls in issue order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    /// `(pool, ip)` of every release call in issue order
    pub fn release_calls(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::ReleaseIp { pool, ip } => Some((pool, ip)),
                GatewayCall::RemoveFinalizer { .. } => None,
            })
            .collect()
    }

    /// `namespace/name` of every finalizer removal in issue order
    pub fn finalizer_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::RemoveFinalizer { namespace, name } => Some(format!("{}/{}", namespace, name)),
                GatewayCall::ReleaseIp { .. } => None,
            })
            .collect()
    }

    fn injected_error(what: &str) -> GatewayError {
        GatewayError::InvalidResource(format!("injected failure: {}", what))
    }

    fn check_wep_reads(&self) -> Result<(), GatewayError> {
        if *self.failing_wep_reads.lock().unwrap() {
            return Err(Self::injected_error("WorkloadEndpoint read"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterGateway for MockGateway {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError> {
        self.pods
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Pod {}/{}", namespace, name)))
    }

    async fn is_node_ready(&self, name: &str) -> Result<bool, GatewayError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| GatewayError::NotFound(format!("Node {}", name)))
    }

    async fn is_stateful_pod_pending(&self, namespace: &str, name: &str) -> Result<bool, GatewayError> {
        Ok(self.stateful_pending.lock().unwrap().contains(&key(namespace, name)))
    }

    async fn list_ip_pools(&self) -> Result<Vec<IPPool>, GatewayError> {
        Ok(self.pools.lock().unwrap().values().cloned().collect())
    }

    async fn list_ips_allocated_in_pool(&self, pool: &str) -> Result<BTreeMap<String, PoolIPAllocation>, GatewayError> {
        self.pools
            .lock()
            .unwrap()
            .get(pool)
            .map(IPPool::allocations)
            .ok_or_else(|| GatewayError::NotFound(format!("IPPool {}", pool)))
    }

    async fn release_ip(&self, pool: &str, ip: &str, container_id: Option<&str>) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(GatewayCall::ReleaseIp {
            pool: pool.to_string(),
            ip: ip.to_string(),
        });
        if self.failing_releases.lock().unwrap().contains(ip) {
            return Err(Self::injected_error("release"));
        }

        let mut pools = self.pools.lock().unwrap();
        let status = pools
            .get_mut(pool)
            .ok_or_else(|| GatewayError::NotFound(format!("IPPool {}", pool)))?
            .status
            .get_or_insert_with(IPPoolStatus::default);

        let holder = status.allocated_ips.get(ip).map(|r| r.container_id.clone());
        match holder {
            None => Err(GatewayError::NotFound(format!("IP {} in IPPool {}", ip, pool))),
            Some(holder) if container_id.is_some_and(|c| c != holder) => Err(
                GatewayError::NotFound(format!("IP {} in IPPool {} for another container", ip, pool)),
            ),
            Some(_) => {
                status.allocated_ips.remove(ip);
                status.allocated_ip_count = status.allocated_ips.len() as u64;
                Ok(())
            }
        }
    }

    async fn get_wep(&self, namespace: &str, name: &str) -> Result<WorkloadEndpoint, GatewayError> {
        self.check_wep_reads()?;
        self.wep(namespace, name)
            .ok_or_else(|| GatewayError::NotFound(format!("WorkloadEndpoint {}/{}", namespace, name)))
    }

    async fn list_historical_ips(&self, namespace: &str, name: &str) -> Result<HistoricalIps, GatewayError> {
        let wep = self.get_wep(namespace, name).await?;
        Ok(group_history(wep.history()))
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(GatewayCall::RemoveFinalizer {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(wep) = self.weps.lock().unwrap().get_mut(&key(namespace, name)) {
            if let Some(finalizers) = wep.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != IP_GC_FINALIZER);
            }
        }
        Ok(())
    }

    async fn check_current_container_id(&self, namespace: &str, name: &str, container_id: &str) -> Result<bool, GatewayError> {
        let wep = self.get_wep(namespace, name).await?;
        Ok(wep.current_container_id().is_none_or(|current| current == container_id))
    }
}
