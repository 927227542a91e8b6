//! ClusterGateway trait for mocking
//!
//! This trait abstracts cluster access so the GC engine can be unit tested.
//! `KubeGateway` implements it over the Kubernetes API; tests use `MockGateway`.

use crate::error::GatewayError;
use crate::models::HistoricalIps;
use crds::{IPPool, PoolIPAllocation, WorkloadEndpoint};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Trait for cluster resource operations used by the IP garbage collector
///
/// Missing objects are reported as [`GatewayError::NotFound`].
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterGateway: Send + Sync {
    // Workloads
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError>;
    /// Whether the node reports `Ready=True`.
    async fn is_node_ready(&self, name: &str) -> Result<bool, GatewayError>;
    /// Whether the StatefulSet owning `name` still wants that ordinal, i.e. the
    /// Pod is absent only because it is being recreated.
    async fn is_stateful_pod_pending(&self, namespace: &str, name: &str) -> Result<bool, GatewayError>;

    // IPPool
    async fn list_ip_pools(&self) -> Result<Vec<IPPool>, GatewayError>;
    async fn list_ips_allocated_in_pool(&self, pool: &str) -> Result<BTreeMap<String, PoolIPAllocation>, GatewayError>;
    /// Removes the allocation record for `ip`. With a `container_id` the record
    /// is only removed when it still belongs to that container.
    async fn release_ip(&self, pool: &str, ip: &str, container_id: Option<&str>) -> Result<(), GatewayError>;

    // WorkloadEndpoint
    async fn get_wep(&self, namespace: &str, name: &str) -> Result<WorkloadEndpoint, GatewayError>;
    async fn list_historical_ips(&self, namespace: &str, name: &str) -> Result<HistoricalIps, GatewayError>;
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;
    /// Whether `container_id` is the endpoint's current container. An endpoint
    /// without a current allocation matches any container.
    async fn check_current_container_id(&self, namespace: &str, name: &str, container_id: &str) -> Result<bool, GatewayError>;
}
