//! IP GC Controller
//!
//! Reclaims Pod IP allocations whose owners are gone:
//! - Watches Pods and traces terminating or completed ones until their grace period ends
//! - Periodically sweeps every IPPool for allocations that no live Pod owns
//! - Releases IPs and WorkloadEndpoint finalizers through a bounded worker pool
//!
//! Only the elected leader mutates cluster state.

mod backoff;
mod config;
mod controller;
mod entry;
mod error;
mod health;
mod leader;
mod probes;
mod release;
mod store;
mod sweeper;
mod tracer;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::GcConfig;
use crate::error::ControllerError;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // kube's rustls client needs a process-wide crypto provider.
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting IP GC Controller");

    // Load configuration from environment variables
    let config = GcConfig::from_env()?;

    info!("Configuration:");
    info!("  GC enabled: {}", config.enabled);
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Release workers: {}", config.release_workers);
    info!("  Sweep interval: {:?}", config.default_sweep_interval);
    info!("  Trace interval: {:?}", config.trace_interval);
    info!("  Additional grace delay: {:?}", config.additional_grace_delay);
    info!("  StatefulSet protection: {}", config.stateful_set_enabled);
    info!(
        "  Leader election: {} (lease {}/{})",
        config.leader.enabled, config.leader.lease_namespace, config.leader.lease_name
    );
    info!("  Probe address: {}", config.probe_bind_address);

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    // Initialize and run controller
    let controller = Controller::new(config, token).await?;
    controller.run().await?;

    Ok(())
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down gracefully...");
    token.cancel();
}
