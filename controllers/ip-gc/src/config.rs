//! Controller configuration
//!
//! Every setting comes from an environment variable and has a default, so an
//! empty environment yields a working single-replica setup.

use crate::entry::TracingPolicy;
use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Lease-based leader election settings
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub lease_namespace: String,
    /// Holder identity written into the Lease
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: "ip-gc-controller".to_string(),
            lease_namespace: "kube-system".to_string(),
            identity: uuid::Uuid::new_v4().to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// IP GC engine settings
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// When false the process only serves probes
    pub enabled: bool,
    pub release_workers: usize,
    pub signal_channel_buffer: usize,
    pub default_sweep_interval: Duration,
    pub trace_interval: Duration,
    /// Delay before Succeeded/Failed Pods are released
    pub additional_grace_delay: Duration,
    /// How long a producer waits for room on the release channel
    pub signal_timeout: Duration,
    pub max_tracked_pods: usize,
    pub gc_terminating_pod_on_ready_node: bool,
    pub gc_terminating_pod_on_not_ready_node: bool,
    /// Protect IPs of StatefulSet Pods that are being recreated
    pub stateful_set_enabled: bool,
    pub watcher_max_retries: u32,
    /// Restrict the Pod watch to one namespace (all namespaces when unset)
    pub watch_namespace: Option<String>,
    pub leader: LeaderElectionConfig,
    pub probe_bind_address: SocketAddr,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            release_workers: 3,
            signal_channel_buffer: 5000,
            default_sweep_interval: Duration::from_secs(600),
            trace_interval: Duration::from_secs(5),
            additional_grace_delay: Duration::from_secs(5),
            signal_timeout: Duration::from_secs(3),
            max_tracked_pods: 100_000,
            gc_terminating_pod_on_ready_node: true,
            gc_terminating_pod_on_not_ready_node: true,
            stateful_set_enabled: true,
            watcher_max_retries: 5,
            watch_namespace: None,
            leader: LeaderElectionConfig::default(),
            probe_bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl GcConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let leader_defaults = defaults.leader;

        let config = Self {
            enabled: parse_bool(&lookup, "GC_ENABLED", defaults.enabled)?,
            release_workers: parse(&lookup, "GC_RELEASE_WORKERS", defaults.release_workers)?,
            signal_channel_buffer: parse(&lookup, "GC_SIGNAL_CHANNEL_BUFFER", defaults.signal_channel_buffer)?,
            default_sweep_interval: parse_secs(
                &lookup,
                "GC_DEFAULT_SWEEP_INTERVAL_SECS",
                defaults.default_sweep_interval,
            )?,
            trace_interval: parse_secs(&lookup, "GC_TRACE_INTERVAL_SECS", defaults.trace_interval)?,
            additional_grace_delay: parse_secs(
                &lookup,
                "GC_ADDITIONAL_GRACE_DELAY_SECS",
                defaults.additional_grace_delay,
            )?,
            signal_timeout: parse_secs(&lookup, "GC_SIGNAL_TIMEOUT_SECS", defaults.signal_timeout)?,
            max_tracked_pods: parse(&lookup, "GC_MAX_TRACKED_PODS", defaults.max_tracked_pods)?,
            gc_terminating_pod_on_ready_node: parse_bool(
                &lookup,
                "GC_TERMINATING_POD_ON_READY_NODE",
                defaults.gc_terminating_pod_on_ready_node,
            )?,
            gc_terminating_pod_on_not_ready_node: parse_bool(
                &lookup,
                "GC_TERMINATING_POD_ON_NOT_READY_NODE",
                defaults.gc_terminating_pod_on_not_ready_node,
            )?,
            stateful_set_enabled: parse_bool(&lookup, "GC_STATEFULSET_ENABLED", defaults.stateful_set_enabled)?,
            watcher_max_retries: parse(&lookup, "GC_WATCHER_MAX_RETRIES", defaults.watcher_max_retries)?,
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            leader: LeaderElectionConfig {
                enabled: parse_bool(&lookup, "LEADER_ELECTION_ENABLED", leader_defaults.enabled)?,
                lease_name: lookup("LEADER_LEASE_NAME").unwrap_or(leader_defaults.lease_name),
                lease_namespace: lookup("POD_NAMESPACE").unwrap_or(leader_defaults.lease_namespace),
                identity: lookup("POD_NAME").unwrap_or(leader_defaults.identity),
                lease_duration: parse_secs(&lookup, "LEADER_LEASE_DURATION_SECS", leader_defaults.lease_duration)?,
                renew_deadline: parse_secs(&lookup, "LEADER_RENEW_DEADLINE_SECS", leader_defaults.renew_deadline)?,
                retry_period: parse_secs(&lookup, "LEADER_RETRY_PERIOD_SECS", leader_defaults.retry_period)?,
            },
            probe_bind_address: parse(&lookup, "PROBE_BIND_ADDRESS", defaults.probe_bind_address)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks
    pub fn validate(&self) -> Result<(), ControllerError> {
        let non_zero = [
            ("GC_RELEASE_WORKERS", self.release_workers == 0),
            ("GC_SIGNAL_CHANNEL_BUFFER", self.signal_channel_buffer == 0),
            ("GC_DEFAULT_SWEEP_INTERVAL_SECS", self.default_sweep_interval.is_zero()),
            ("GC_TRACE_INTERVAL_SECS", self.trace_interval.is_zero()),
            ("GC_SIGNAL_TIMEOUT_SECS", self.signal_timeout.is_zero()),
            ("GC_MAX_TRACKED_PODS", self.max_tracked_pods == 0),
        ];
        if let Some((key, _)) = non_zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ControllerError::InvalidConfig(format!("{} must be greater than zero", key)));
        }

        if self.leader.enabled {
            let leader = &self.leader;
            if leader.retry_period.is_zero() {
                return Err(ControllerError::InvalidConfig(
                    "LEADER_RETRY_PERIOD_SECS must be greater than zero".to_string(),
                ));
            }
            if leader.renew_deadline >= leader.lease_duration {
                return Err(ControllerError::InvalidConfig(format!(
                    "LEADER_RENEW_DEADLINE_SECS ({}s) must be less than LEADER_LEASE_DURATION_SECS ({}s)",
                    leader.renew_deadline.as_secs(),
                    leader.lease_duration.as_secs()
                )));
            }
            if leader.retry_period >= leader.renew_deadline {
                return Err(ControllerError::InvalidConfig(format!(
                    "LEADER_RETRY_PERIOD_SECS ({}s) must be less than LEADER_RENEW_DEADLINE_SECS ({}s)",
                    leader.retry_period.as_secs(),
                    leader.renew_deadline.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// The observation policy shared by the watcher and the sweeper
    pub fn tracing_policy(&self) -> TracingPolicy {
        TracingPolicy {
            additional_grace_delay: chrono::Duration::from_std(self.additional_grace_delay)
                .unwrap_or(chrono::Duration::MAX),
            gc_terminating_pod_on_ready_node: self.gc_terminating_pod_on_ready_node,
            gc_terminating_pod_on_not_ready_node: self.gc_terminating_pod_on_not_ready_node,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{}: cannot parse {:?}", key, raw))),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ControllerError> {
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, ControllerError> {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes" | "on") => Ok(true),
        Some("false" | "0" | "no" | "off") => Ok(false),
        Some(other) => Err(ControllerError::InvalidConfig(format!(
            "{}: expected a boolean, got {:?}",
            key, other
        ))),
    }
}
