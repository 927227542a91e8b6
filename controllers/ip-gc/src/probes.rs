//! Health probes and diagnostics over HTTP

use crate::controller::GcEngine;
use crate::error::ControllerError;
use crate::health::HealthReport;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state of the probe server. `engine` is `None` when GC is disabled.
#[derive(Clone, Default)]
pub struct ProbeState {
    engine: Option<Arc<GcEngine>>,
}

impl ProbeState {
    pub fn new(engine: Option<Arc<GcEngine>>) -> Self {
        Self { engine }
    }
}

/// Build the router
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/debug/tracked-pods", get(tracked_pods))
        .route("/debug/sweep", post(trigger_sweep))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve probes on an already bound listener until the token is cancelled
pub async fn serve(listener: TcpListener, state: ProbeState, token: CancellationToken) -> Result<(), ControllerError> {
    info!("Serving probes on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

fn gc_disabled() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "IP garbage collection is disabled" })),
    )
        .into_response()
}

/// Liveness: every engine loop has completed a pass recently
async fn healthz(State(state): State<ProbeState>) -> Response {
    let report = match &state.engine {
        Some(engine) => engine.health(),
        None => HealthReport {
            healthy: true,
            gc_enabled: false,
            leader: false,
            tracked_pods: 0,
            loops: Vec::new(),
        },
    };
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Readiness: the engine's loops are running
async fn readyz(State(state): State<ProbeState>) -> StatusCode {
    match &state.engine {
        Some(engine) if !engine.is_started() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

async fn tracked_pods(State(state): State<ProbeState>) -> Response {
    match &state.engine {
        Some(engine) => Json(engine.list_tracked_pods()).into_response(),
        None => gc_disabled(),
    }
}

async fn trigger_sweep(State(state): State<ProbeState>) -> Response {
    match &state.engine {
        Some(engine) => {
            let queued = engine.trigger_sweep_now();
            (StatusCode::ACCEPTED, Json(json!({ "queued": queued }))).into_response()
        }
        None => gc_disabled(),
    }
}
