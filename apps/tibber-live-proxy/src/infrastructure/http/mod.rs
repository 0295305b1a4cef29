//! HTTP Surface: Health, Metrics and Live Data
//!
//! One axum server for operations and for downstream consumers.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (change listener running)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /live-data` - Server-Sent Events for every home
//! - `GET /live-data/{home_id}` - Server-Sent Events for one home
//!
//! Each SSE connection is its own broadcaster subscriber with a fresh client
//! id, so a consumer that falls behind is evicted and its stream ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::services::SessionSupervisor;
use crate::domain::telemetry::DeviceId;
use crate::infrastructure::broadcast::{
    BroadcastStats, SharedBroadcastHub, SubscriberKey, Subscription,
};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Credentials with a registration.
    pub active_credentials: usize,
    /// Protocol sessions currently running.
    pub active_sessions: usize,
    /// Broadcaster counters.
    pub subscribers: BroadcastStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Listening and streaming.
    Healthy,
    /// Listening, but no session is running.
    Degraded,
    /// The change listener is not running.
    Unhealthy,
}

impl HealthStatus {
    const fn determine(ready: bool, sessions: usize) -> Self {
        match (ready, sessions) {
            (false, _) => Self::Unhealthy,
            (true, 0) => Self::Degraded,
            (true, _) => Self::Healthy,
        }
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
pub struct HttpServerState {
    version: String,
    started_at: Instant,
    supervisor: SessionSupervisor,
    hub: SharedBroadcastHub,
}

impl HttpServerState {
    /// Create new server state.
    #[must_use]
    pub fn new(version: String, supervisor: SessionSupervisor, hub: SharedBroadcastHub) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            supervisor,
            hub,
        }
    }
}

/// Build the router with every route.
#[must_use]
pub fn router(state: Arc<HttpServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/live-data", get(live_data_handler))
        .route("/live-data/{home_id}", get(home_live_data_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// HTTP server for health, metrics and live data.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpServerState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    if state.supervisor.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn live_data_handler(
    State(state): State<Arc<HttpServerState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let key = SubscriberKey::firehose(&Uuid::new_v4().to_string());
    event_stream(state.hub.subscribe(key))
}

async fn home_live_data_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(home_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let key =
        SubscriberKey::for_device_client(&DeviceId::new(home_id), &Uuid::new_v4().to_string());
    event_stream(state.hub.subscribe(key))
}

fn event_stream(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    tracing::debug!(key = %subscription.key(), "Live-data client connected");
    let events = subscription.map(|update| Event::default().json_data(update.as_ref()));
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn build_health_response(state: &HttpServerState) -> HealthResponse {
    let active_sessions = state.supervisor.session_count();

    HealthResponse {
        status: HealthStatus::determine(state.supervisor.is_ready(), active_sessions),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        active_credentials: state.supervisor.active_credentials().len(),
        active_sessions,
        subscribers: state.hub.stats(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
