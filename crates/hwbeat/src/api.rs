//! HTTP API for health checks, Prometheus metrics and lifecycle state

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beat_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::BeatMetrics,
    state::{AgentState, AgentStateHandle, ReadinessEvent},
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: BeatMetrics,
    pub agent_state: AgentStateHandle,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: BeatMetrics,
        agent_state: AgentStateHandle,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            agent_state,
        }
    }
}

#[derive(Debug, Serialize)]
struct StateResponse {
    state: AgentState,
    readiness: Option<ReadinessEvent>,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still shipping, with retries
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 while the beat is running
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready && state.agent_state.get() == AgentState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Lifecycle state and the readiness signal
async fn agent_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StateResponse {
        state: state.agent_state.get(),
        readiness: state.agent_state.readiness(),
    })
}

/// Prometheus metrics endpoint
async fn metrics(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/state", get(agent_state))
        .with_state(state)
}

/// Start the API server
pub async fn serve(host: String, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
