//! Pod liveness entries
//!
//! A [`PodEntry`] is what the GC engine remembers about one Pod identity. Its
//! [`TracingState`] moves strictly forward (`Untracked -> Tracing -> Released`),
//! and a deadline, once computed, is never recomputed.

use chrono::{DateTime, Duration, Utc};
use ipam_gateway::{ClusterGateway, HistoricalIps};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Pod phase as reported by the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Why an entry started tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TracingReason {
    Terminating,
    Succeeded,
    Failed,
    /// The Pod vanished before a terminating or terminal state was seen.
    Unknown,
}

impl fmt::Display for TracingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Terminating => "Terminating",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(reason)
    }
}

/// Tracing state machine of a [`PodEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TracingState {
    Untracked,
    Tracing {
        reason: TracingReason,
        deadline: DateTime<Utc>,
    },
    Released,
}

impl TracingState {
    /// Only `Untracked -> Tracing`, `Untracked -> Released` and
    /// `Tracing -> Released` are permitted.
    pub fn can_transition_to(&self, next: &TracingState) -> bool {
        matches!(
            (self, next),
            (Self::Untracked, Self::Tracing { .. })
                | (Self::Untracked, Self::Released)
                | (Self::Tracing { .. }, Self::Released)
        )
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Tracing { deadline, .. } => Some(*deadline),
            Self::Untracked | Self::Released => None,
        }
    }

    pub fn is_tracing(&self) -> bool {
        matches!(self, Self::Tracing { .. })
    }
}

/// An IP recorded in the endpoint history when tracing began.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracedIp {
    pub pool: String,
    pub ip: String,
}

/// Store key: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Readiness of the node a Pod is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeReadiness {
    Ready,
    NotReady,
    Unknown,
}

/// The knobs that decide when an observed Pod starts tracing.
#[derive(Debug, Clone)]
pub struct TracingPolicy {
    /// Delay added to `now` for Succeeded/Failed Pods.
    pub additional_grace_delay: Duration,
    pub gc_terminating_pod_on_ready_node: bool,
    pub gc_terminating_pod_on_not_ready_node: bool,
}

impl Default for TracingPolicy {
    fn default() -> Self {
        Self {
            additional_grace_delay: Duration::seconds(5),
            gc_terminating_pod_on_ready_node: true,
            gc_terminating_pod_on_not_ready_node: true,
        }
    }
}

/// What the engine remembers about a Pod identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEntry {
    pub pod_name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub node_name: Option<String>,
    pub entry_create_time: DateTime<Utc>,
    pub phase: PodPhase,
    pub terminating_start_time: Option<DateTime<Utc>>,
    pub graceful_period_seconds: Option<i64>,
    #[serde(flatten)]
    pub state: TracingState,
    #[serde(default)]
    pub traced_ips: Vec<TracedIp>,
}

impl PodEntry {
    /// A fresh, untracked entry.
    pub fn new(namespace: &str, pod_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            uid: None,
            node_name: None,
            entry_create_time: now,
            phase: PodPhase::Unknown,
            terminating_start_time: None,
            graceful_period_seconds: None,
            state: TracingState::Untracked,
            traced_ips: Vec::new(),
        }
    }

    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.pod_name)
    }

    /// Builds an entry from a Pod object.
    ///
    /// Returns `None` for Pods without a name. The entry is `Tracing` when the
    /// Pod is terminating (and the node policy allows it) or has reached
    /// `Succeeded`/`Failed`; otherwise it is `Untracked`.
    pub fn observe(pod: &Pod, policy: &TracingPolicy, node: NodeReadiness, now: DateTime<Utc>) -> Option<Self> {
        let name = pod.metadata.name.as_deref()?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

        let mut entry = Self::new(namespace, name, now);
        entry.uid = pod.metadata.uid.clone();
        entry.node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
        entry.phase = PodPhase::from_status(pod.status.as_ref().and_then(|s| s.phase.as_deref()));

        if let Some(deleted_at) = pod.metadata.deletion_timestamp.as_ref().and_then(to_utc) {
            let grace = pod
                .metadata
                .deletion_grace_period_seconds
                .or_else(|| pod.spec.as_ref().and_then(|s| s.termination_grace_period_seconds));
            entry.terminating_start_time = Some(deleted_at);
            entry.graceful_period_seconds = grace;

            let allowed = match node {
                NodeReadiness::Ready | NodeReadiness::Unknown => policy.gc_terminating_pod_on_ready_node,
                NodeReadiness::NotReady => policy.gc_terminating_pod_on_not_ready_node,
            };
            if allowed {
                entry.state = TracingState::Tracing {
                    reason: TracingReason::Terminating,
                    deadline: deleted_at + Duration::seconds(grace.unwrap_or(0).max(0)),
                };
                return Some(entry);
            }
            debug!(
                pod = %entry.key(),
                node = ?entry.node_name,
                "Terminating pod not traced on this node by policy"
            );
        }

        let reason = match entry.phase {
            PodPhase::Succeeded => Some(TracingReason::Succeeded),
            PodPhase::Failed => Some(TracingReason::Failed),
            PodPhase::Pending | PodPhase::Running | PodPhase::Unknown => None,
        };
        if let Some(reason) = reason {
            entry.state = TracingState::Tracing {
                reason,
                deadline: now + policy.additional_grace_delay,
            };
        }
        Some(entry)
    }

    /// Folds a newer observation of the same identity into this entry.
    ///
    /// A different UID is a new incarnation and replaces the entry. Otherwise
    /// the phase follows the observation while the terminating start time, the
    /// grace period and an existing deadline are kept.
    pub fn merge(&mut self, observed: PodEntry) {
        if let (Some(ours), Some(theirs)) = (&self.uid, &observed.uid) {
            if ours != theirs {
                *self = observed;
                return;
            }
        }

        self.phase = observed.phase;
        if self.uid.is_none() {
            self.uid = observed.uid;
        }
        if observed.node_name.is_some() {
            self.node_name = observed.node_name;
        }
        if self.terminating_start_time.is_none() {
            self.terminating_start_time = observed.terminating_start_time;
        }
        if self.graceful_period_seconds.is_none() {
            self.graceful_period_seconds = observed.graceful_period_seconds;
        }
        self.transition(observed.state);
        for ip in observed.traced_ips {
            if !self.traced_ips.contains(&ip) {
                self.traced_ips.push(ip);
            }
        }
    }

    /// Moves to `next` if the state machine permits it; returns whether it did.
    pub fn transition(&mut self, next: TracingState) -> bool {
        if self.state.can_transition_to(&next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Starts tracing (unless already tracing) and records the IPs to trace.
    pub fn trace(&mut self, reason: TracingReason, deadline: DateTime<Utc>, history: &HistoricalIps) {
        self.transition(TracingState::Tracing { reason, deadline });
        for (pool, ips) in history {
            for historical in ips {
                let traced = TracedIp {
                    pool: pool.clone(),
                    ip: historical.ip.clone(),
                };
                if !self.traced_ips.contains(&traced) {
                    self.traced_ips.push(traced);
                }
            }
        }
    }
}

/// Converts a Kubernetes timestamp to `chrono` through its RFC 3339 wire form.
pub(crate) fn to_utc<T: Serialize>(time: &T) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Readiness of the Pod's node, consulted only for terminating Pods.
pub(crate) async fn node_readiness(gateway: &dyn ClusterGateway, pod: &Pod) -> NodeReadiness {
    if pod.metadata.deletion_timestamp.is_none() {
        return NodeReadiness::Unknown;
    }
    let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
        return NodeReadiness::Unknown;
    };
    match gateway.is_node_ready(node).await {
        Ok(true) => NodeReadiness::Ready,
        Ok(false) => NodeReadiness::NotReady,
        Err(e) => {
            debug!(node, error = %e, "Node readiness unavailable");
            NodeReadiness::Unknown
        }
    }
}
