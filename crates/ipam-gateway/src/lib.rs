//! Cluster Resource Gateway
//!
//! Typed read/write access to the cluster resources the IP garbage collector
//! works on: Pods, Nodes, StatefulSets, `IPPool` and `WorkloadEndpoint`.
//!
//! # Example
//!
//! ```no_run
//! use ipam_gateway::{ClusterGateway, KubeGateway};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let gateway = KubeGateway::new(client);
//!
//! for pool in gateway.list_ip_pools().await? {
//!     let name = pool.metadata.name.unwrap_or_default();
//!     let allocations = gateway.list_ips_allocated_in_pool(&name).await?;
//!     println!("{}: {} allocated", name, allocations.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **`NotFound` as a value**: every lookup maps a missing object to
//!   [`GatewayError::NotFound`] so callers can treat "already gone" as success
//! - **Optimistic updates**: pool and endpoint writes carry the observed
//!   `resourceVersion`
//! - **Mocking**: `MockGateway` (feature `test-util`) keeps everything in memory
//!   and records every mutating call

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod gateway_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeGateway;
pub use error::GatewayError;
pub use gateway_trait::ClusterGateway;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{GatewayCall, MockGateway};
