//! WorkloadEndpoint CRD
//!
//! One endpoint per Pod identity. Records the current allocation and every
//! allocation the identity has ever held, and carries the GC finalizer.

use crate::IP_GC_FINALIZER;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "WorkloadEndpoint",
    shortname = "wep",
    namespaced,
    status = "WorkloadEndpointStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointSpec {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointStatus {
    /// Allocation of the currently running container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentAllocation>,

    /// Every allocation this identity has held, oldest first
    #[serde(default)]
    pub history: Vec<EndpointAllocation>,

    /// Kind of the Pod's top-level controller
    #[serde(default)]
    pub owner_controller_type: String,

    /// Name of the Pod's top-level controller
    #[serde(default)]
    pub owner_controller_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentAllocation {
    /// Container ID of the current sandbox
    pub container_id: String,

    /// Node the container runs on
    #[serde(default)]
    pub node: String,

    /// IPs bound to the current container
    #[serde(default)]
    pub ips: Vec<EndpointAllocation>,
}

/// A single (pool, IP) assignment made for a container.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAllocation {
    /// Container ID the IP was assigned for
    pub container_id: String,

    /// IPPool the IP came from
    pub pool: String,

    /// The IP address
    pub ip: String,

    /// Interface name inside the Pod
    #[serde(default)]
    pub nic: String,

    /// Time of assignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkloadEndpoint {
    /// Container ID of the current allocation, if any.
    pub fn current_container_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.current.as_ref())
            .map(|c| c.container_id.as_str())
    }

    /// Allocation history, empty when the status is unset.
    pub fn history(&self) -> &[EndpointAllocation] {
        self.status.as_ref().map_or(&[], |s| s.history.as_slice())
    }

    /// Whether the GC finalizer is still present.
    pub fn has_gc_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|name| name == IP_GC_FINALIZER))
    }
}
