//! Test utilities for IP GC Controller tests

use crate::config::GcConfig;
use crate::leader::{LeaderGate, StaticLeader};
use chrono::{DateTime, SecondsFormat, Utc};
use crds::{EndpointAllocation, PoolIPAllocation, WorkloadEndpoint, WorkloadEndpointStatus, IP_GC_FINALIZER};
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Create a running test Pod on `node-1`
pub fn create_test_pod(namespace: &str, name: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": "uid-1",
        },
        "spec": {
            "nodeName": "node-1",
            "containers": [{ "name": "app", "image": "busybox" }],
        },
        "status": { "phase": "Running" },
    }))
    .expect("valid test pod")
}

/// Create a Pod that was deleted at `deleted_at` with the given grace period
pub fn terminating_pod(namespace: &str, name: &str, deleted_at: DateTime<Utc>, grace_seconds: i64) -> Pod {
    let mut pod = create_test_pod(namespace, name);
    pod.metadata.deletion_grace_period_seconds = Some(grace_seconds);
    pod.metadata.deletion_timestamp = Some(
        serde_json::from_value(json!(deleted_at.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .expect("valid timestamp"),
    );
    pod
}

/// Set a Pod's phase
pub fn with_phase(mut pod: Pod, phase: &str) -> Pod {
    if let Some(status) = pod.status.as_mut() {
        status.phase = Some(phase.to_string());
    }
    pod
}

/// Create a pool allocation record for `namespace/pod`
pub fn allocation(namespace: &str, pod: &str, container_id: &str, owner_kind: &str) -> PoolIPAllocation {
    PoolIPAllocation {
        pod_name: pod.to_string(),
        namespace: namespace.to_string(),
        container_id: container_id.to_string(),
        nic: "eth0".to_string(),
        node: "node-1".to_string(),
        owner_controller_type: owner_kind.to_string(),
        ..Default::default()
    }
}

/// Create a WorkloadEndpoint carrying the GC finalizer
///
/// `history` entries are `(container_id, pool, ip)`; `current` is the current
/// container ID, if any.
pub fn create_test_wep(
    namespace: &str,
    name: &str,
    current: Option<&str>,
    history: &[(&str, &str, &str)],
) -> WorkloadEndpoint {
    let mut wep = WorkloadEndpoint::new(name, Default::default());
    wep.metadata.namespace = Some(namespace.to_string());
    wep.metadata.finalizers = Some(vec![IP_GC_FINALIZER.to_string()]);
    wep.status = Some(WorkloadEndpointStatus {
        current: current.map(|container_id| crds::CurrentAllocation {
            container_id: container_id.to_string(),
            node: "node-1".to_string(),
            ..Default::default()
        }),
        history: history
            .iter()
            .map(|(container_id, pool, ip)| EndpointAllocation {
                container_id: container_id.to_string(),
                pool: pool.to_string(),
                ip: ip.to_string(),
                nic: "eth0".to_string(),
                allocated_at: None,
            })
            .collect(),
        ..Default::default()
    });
    wep
}

/// Configuration with short intervals for engine tests
pub fn test_config() -> GcConfig {
    GcConfig {
        release_workers: 2,
        signal_channel_buffer: 16,
        trace_interval: Duration::from_millis(20),
        signal_timeout: Duration::from_millis(100),
        ..GcConfig::default()
    }
}

/// A leader gate that starts as leader
pub fn leader() -> Arc<StaticLeader> {
    Arc::new(StaticLeader::new(true))
}

/// A leader gate that starts as follower
pub fn follower() -> Arc<StaticLeader> {
    Arc::new(StaticLeader::new(false))
}

/// A leader gate that answers "leader" to the first `checks` queries and
/// "follower" from then on, like a lease lost partway through a pass.
#[derive(Debug)]
pub struct ExpiringLeader {
    remaining: AtomicUsize,
    state: watch::Sender<bool>,
}

impl ExpiringLeader {
    pub fn after(checks: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(checks),
            state: watch::Sender::new(checks > 0),
        })
    }
}

impl LeaderGate for ExpiringLeader {
    fn is_leader(&self) -> bool {
        let granted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !granted {
            self.state.send_if_modified(|leader| std::mem::replace(leader, false));
        }
        granted
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
