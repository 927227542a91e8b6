//! Workload kinds
//!
//! The controller kinds the IPAM plugin records as the owner of an
//! allocation. GC decisions that depend on the owner match on this enum.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level controller kind owning a Pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum WorkloadKind {
    /// Pod without a controller
    #[default]
    Pod,
    Deployment,
    ReplicaSet,
    /// Pods keep their identity across recreation
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    /// Any controller kind not listed above
    Other(String),
}

impl WorkloadKind {
    /// Parses the controller type string stored in allocation records.
    ///
    /// An empty string means the Pod had no controller.
    pub fn from_controller_type(kind: &str) -> Self {
        match kind {
            "" | "Pod" => Self::Pod,
            "Deployment" => Self::Deployment,
            "ReplicaSet" => Self::ReplicaSet,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            "Job" => Self::Job,
            "CronJob" => Self::CronJob,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => f.write_str("Pod"),
            Self::Deployment => f.write_str("Deployment"),
            Self::ReplicaSet => f.write_str("ReplicaSet"),
            Self::StatefulSet => f.write_str("StatefulSet"),
            Self::DaemonSet => f.write_str("DaemonSet"),
            Self::Job => f.write_str("Job"),
            Self::CronJob => f.write_str("CronJob"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}
