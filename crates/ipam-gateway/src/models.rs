//! Value types returned by the gateway

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An IP a workload identity has held, as recorded in its endpoint history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalIp {
    pub ip: String,
    pub container_id: String,
    #[serde(default)]
    pub nic: String,
}

/// Historical IPs grouped by pool name.
pub type HistoricalIps = BTreeMap<String, Vec<HistoricalIp>>;

/// Groups an endpoint history by pool, keeping the latest container ID for an
/// IP that appears more than once.
pub fn group_history(history: &[crds::EndpointAllocation]) -> HistoricalIps {
    let mut grouped: HistoricalIps = BTreeMap::new();
    for record in history {
        let ips = grouped.entry(record.pool.clone()).or_default();
        match ips.iter_mut().find(|h| h.ip == record.ip) {
            Some(existing) => {
                existing.container_id = record.container_id.clone();
                existing.nic = record.nic.clone();
            }
            None => ips.push(HistoricalIp {
                ip: record.ip.clone(),
                container_id: record.container_id.clone(),
                nic: record.nic.clone(),
            }),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::EndpointAllocation;

    fn record(container: &str, pool: &str, ip: &str) -> EndpointAllocation {
        EndpointAllocation {
            container_id: container.to_string(),
            pool: pool.to_string(),
            ip: ip.to_string(),
            nic: "eth0".to_string(),
            allocated_at: None,
        }
    }

    #[test]
    fn test_group_history_by_pool() {
        let grouped = group_history(&[
            record("c1", "pool-a", "10.0.0.4"),
            record("c1", "pool-b", "10.1.0.4"),
            record("c2", "pool-a", "10.0.0.5"),
        ]);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["pool-a"].len(), 2);
        assert_eq!(grouped["pool-b"][0].ip, "10.1.0.4");
    }

    #[test]
    fn test_group_history_keeps_latest_container() {
        let grouped = group_history(&[
            record("c1", "pool-a", "10.0.0.4"),
            record("c2", "pool-a", "10.0.0.4"),
        ]);

        assert_eq!(grouped["pool-a"].len(), 1);
        assert_eq!(grouped["pool-a"][0].container_id, "c2");
    }
}
