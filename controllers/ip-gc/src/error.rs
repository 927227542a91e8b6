//! Controller-specific error types.
//!
//! This module defines error types specific to the IP GC Controller
//! that are not covered by upstream library errors.

use crate::store::StoreError;
use ipam_gateway::GatewayError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IP GC Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster gateway error
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Pod liveness store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    Server(#[from] std::io::Error),
}

impl ControllerError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(_) | Self::Watch(_) => true,
            Self::Gateway(e) => !e.is_not_found(),
            Self::Store(_) | Self::InvalidConfig(_) | Self::Server(_) => false,
        }
    }
}
