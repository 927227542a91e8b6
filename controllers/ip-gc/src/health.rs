//! Liveness of the engine's periodic loops

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Last time a periodic loop completed a pass.
#[derive(Debug)]
pub struct LoopHeartbeat {
    name: &'static str,
    /// Milliseconds since the epoch; 0 before the first pass.
    last_beat_ms: AtomicI64,
    max_silence: Duration,
}

impl LoopHeartbeat {
    /// A loop that runs every `interval` is considered stuck after three missed passes.
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            last_beat_ms: AtomicI64::new(0),
            max_silence: interval * 3 + Duration::from_secs(30),
        }
    }

    pub fn beat(&self, now: DateTime<Utc>) {
        self.last_beat_ms.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        match self.last_beat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// A loop that has not completed its first pass yet counts as healthy.
    pub fn status(&self, now: DateTime<Utc>) -> LoopHealth {
        let last_beat = self.last_beat();
        let healthy = last_beat.is_none_or(|at| (now - at).to_std().map_or(true, |silence| silence <= self.max_silence));
        LoopHealth {
            name: self.name,
            healthy,
            last_beat,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub last_beat: Option<DateTime<Utc>>,
}

/// Engine health as served on `/healthz`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub gc_enabled: bool,
    pub leader: bool,
    pub tracked_pods: usize,
    pub loops: Vec<LoopHealth>,
}
