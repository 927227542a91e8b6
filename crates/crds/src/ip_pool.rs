//! IPPool CRD
//!
//! Defines IP address pools and the allocation records the IPAM plugin writes
//! into their status.

use crate::workload::WorkloadKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "IPPool",
    status = "IPPoolStatus",
    printcolumn = r#"{"name":"Subnet","type":"string","jsonPath":".spec.subnet"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.allocatedIPCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Subnet in CIDR notation (e.g. "10.0.0.0/24")
    pub subnet: String,

    /// IP ranges or single IPs that belong to the pool
    #[serde(default)]
    pub ips: Vec<String>,

    /// Gateway handed out with every allocation (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolStatus {
    /// Allocation records keyed by IP address
    #[serde(default, rename = "allocatedIPs")]
    pub allocated_ips: BTreeMap<String, PoolIPAllocation>,

    /// Number of allocated IPs
    #[serde(default, rename = "allocatedIPCount")]
    pub allocated_ip_count: u64,
}

/// One allocated IP in a pool: who holds it and through which interface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolIPAllocation {
    /// Name of the Pod holding the IP
    pub pod_name: String,

    /// Namespace of the Pod holding the IP
    pub namespace: String,

    /// UID of the Pod at allocation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_uid: Option<String>,

    /// Container ID the CNI plugin was invoked for
    pub container_id: String,

    /// Interface name inside the Pod (e.g. "eth0")
    #[serde(default)]
    pub nic: String,

    /// Node the Pod was scheduled on
    #[serde(default)]
    pub node: String,

    /// Kind of the Pod's top-level controller (e.g. "StatefulSet")
    #[serde(default)]
    pub owner_controller_type: String,

    /// Name of the Pod's top-level controller
    #[serde(default)]
    pub owner_controller_name: String,
}

impl PoolIPAllocation {
    /// Workload kind the allocation was recorded for.
    pub fn owner_kind(&self) -> WorkloadKind {
        WorkloadKind::from_controller_type(&self.owner_controller_type)
    }
}

impl IPPool {
    /// Allocation records of this pool, empty when the status is unset.
    pub fn allocations(&self) -> BTreeMap<String, PoolIPAllocation> {
        self.status
            .as_ref()
            .map(|s| s.allocated_ips.clone())
            .unwrap_or_default()
    }
}
