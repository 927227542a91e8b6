//! Kubernetes-backed gateway implementation

use crate::error::GatewayError;
use crate::gateway_trait::ClusterGateway;
use crate::models::{group_history, HistoricalIps};
use crds::{IPPool, PoolIPAllocation, WorkloadEndpoint, IP_GC_FINALIZER};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Gateway over the Kubernetes API.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl std::fmt::Debug for KubeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeGateway").finish_non_exhaustive()
    }
}

impl KubeGateway {
    /// Creates a gateway from an existing Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn weps(&self, namespace: &str) -> Api<WorkloadEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pools(&self) -> Api<IPPool> {
        Api::all(self.client.clone())
    }

    async fn get_pool(&self, pool: &str) -> Result<IPPool, GatewayError> {
        self.pools()
            .get_opt(pool)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("IPPool {}", pool)))
    }
}

/// Splits a StatefulSet Pod name into its StatefulSet name and ordinal.
pub(crate) fn stateful_identity(pod_name: &str) -> Option<(&str, i32)> {
    let (set, ordinal) = pod_name.rsplit_once('-')?;
    if set.is_empty() {
        return None;
    }
    ordinal.parse::<i32>().ok().filter(|o| *o >= 0).map(|o| (set, o))
}

/// Whether the StatefulSet still wants the given ordinal.
pub(crate) fn ordinal_in_range(set: &StatefulSet, ordinal: i32) -> bool {
    let Some(spec) = set.spec.as_ref() else {
        return false;
    };
    let replicas = spec.replicas.unwrap_or(1);
    let start = spec.ordinals.as_ref().and_then(|o| o.start).unwrap_or(0);
    ordinal >= start && ordinal < start + replicas
}

#[async_trait::async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, GatewayError> {
        self.pods(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Pod {}/{}", namespace, name)))
    }

    async fn is_node_ready(&self, name: &str) -> Result<bool, GatewayError> {
        let node = Api::<Node>::all(self.client.clone())
            .get_opt(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("Node {}", name)))?;

        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "True");
        Ok(ready)
    }

    async fn is_stateful_pod_pending(&self, namespace: &str, name: &str) -> Result<bool, GatewayError> {
        let Some((set_name, ordinal)) = stateful_identity(name) else {
            debug!("Pod name {}/{} carries no StatefulSet ordinal", namespace, name);
            return Ok(false);
        };

        let sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match sets.get_opt(set_name).await? {
            Some(set) => Ok(ordinal_in_range(&set, ordinal)),
            None => Ok(false),
        }
    }

    async fn list_ip_pools(&self) -> Result<Vec<IPPool>, GatewayError> {
        Ok(self.pools().list(&ListParams::default()).await?.items)
    }

    async fn list_ips_allocated_in_pool(&self, pool: &str) -> Result<BTreeMap<String, PoolIPAllocation>, GatewayError> {
        Ok(self.get_pool(pool).await?.allocations())
    }

    async fn release_ip(&self, pool: &str, ip: &str, container_id: Option<&str>) -> Result<(), GatewayError> {
        let current = self.get_pool(pool).await?;
        let mut allocations = current.allocations();

        let Some(record) = allocations.get(ip) else {
            return Err(GatewayError::NotFound(format!("IP {} in IPPool {}", ip, pool)));
        };
        if let Some(expected) = container_id {
            if record.container_id != expected {
                return Err(GatewayError::NotFound(format!(
                    "IP {} in IPPool {} for container {} (now held by {})",
                    ip, pool, expected, record.container_id
                )));
            }
        }
        allocations.remove(ip);

        let resource_version = current.metadata.resource_version.clone().ok_or_else(|| {
            GatewayError::InvalidResource(format!("IPPool {} has no resourceVersion", pool))
        })?;

        // A null value deletes the key under JSON merge patch semantics.
        let mut removed = serde_json::Map::new();
        removed.insert(ip.to_string(), serde_json::Value::Null);
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": {
                "allocatedIPs": removed,
                "allocatedIPCount": allocations.len(),
            }
        });
        self.pools()
            .patch_status(pool, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| GatewayError::from_kube(e, || format!("IPPool {}", pool)))?;

        info!("Released IP {} from IPPool {}", ip, pool);
        Ok(())
    }

    async fn get_wep(&self, namespace: &str, name: &str) -> Result<WorkloadEndpoint, GatewayError> {
        self.weps(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("WorkloadEndpoint {}/{}", namespace, name)))
    }

    async fn list_historical_ips(&self, namespace: &str, name: &str) -> Result<HistoricalIps, GatewayError> {
        let wep = self.get_wep(namespace, name).await?;
        Ok(group_history(wep.history()))
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let wep = match self.get_wep(namespace, name).await {
            Ok(wep) => wep,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !wep.has_gc_finalizer() {
            debug!("WorkloadEndpoint {}/{} has no GC finalizer", namespace, name);
            return Ok(());
        }

        let remaining: Vec<String> = wep
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != IP_GC_FINALIZER)
            .collect();
        let patch = json!({
            "metadata": {
                "resourceVersion": wep.metadata.resource_version,
                "finalizers": remaining,
            }
        });
        let patched = self
            .weps(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| GatewayError::from_kube(e, || format!("WorkloadEndpoint {}/{}", namespace, name)));
        match patched {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!("WorkloadEndpoint {}/{} was deleted before its finalizer was removed", namespace, name);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        info!("Removed GC finalizer from WorkloadEndpoint {}/{}", namespace, name);
        Ok(())
    }

    async fn check_current_container_id(&self, namespace: &str, name: &str, container_id: &str) -> Result<bool, GatewayError> {
        let wep = self.get_wep(namespace, name).await?;
        Ok(wep.current_container_id().is_none_or(|current| current == container_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stateful_set(replicas: i32, start: Option<i32>) -> StatefulSet {
        serde_json::from_value(json!({
            "metadata": { "name": "db", "namespace": "ns" },
            "spec": {
                "replicas": replicas,
                "ordinals": start.map(|s| json!({ "start": s })),
                "serviceName": "db",
                "selector": {},
                "template": {}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_stateful_identity_parsing() {
        assert_eq!(stateful_identity("db-0"), Some(("db", 0)));
        assert_eq!(stateful_identity("my-db-12"), Some(("my-db", 12)));
        assert_eq!(stateful_identity("web-7d9f8-xk2p4"), None);
        assert_eq!(stateful_identity("db"), None);
        assert_eq!(stateful_identity("-3"), None);
    }

    #[test]
    fn test_ordinal_in_range() {
        let set = stateful_set(3, None);
        assert!(ordinal_in_range(&set, 0));
        assert!(ordinal_in_range(&set, 2));
        assert!(!ordinal_in_range(&set, 3));

        let shifted = stateful_set(2, Some(5));
        assert!(!ordinal_in_range(&shifted, 0));
        assert!(ordinal_in_range(&shifted, 6));
        assert!(!ordinal_in_range(&shifted, 7));
    }
}
