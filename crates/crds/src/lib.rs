//! Pod IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the IPAM controllers.

pub mod ip_pool;
pub mod workload;
pub mod workload_endpoint;

pub use ip_pool::*;
pub use workload::*;
pub use workload_endpoint::*;

/// API group of every resource in this crate.
pub const API_GROUP: &str = "ipam.microscaler.io";

/// Finalizer that keeps a WorkloadEndpoint alive until its IPs are released.
pub const IP_GC_FINALIZER: &str = "ipam.microscaler.io/ip-gc";
