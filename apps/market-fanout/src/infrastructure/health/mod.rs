//! Health Check, Statistics, Metrics and Ingest Endpoint
//!
//! HTTP endpoint for health checks, feed status, engine statistics and
//! Prometheus metrics. Used by container orchestrators, load balancers and
//! monitoring systems. With an external feed it also accepts ticks.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with feed info and statistics
//! - `GET /healthz` - liveness check (simple OK)
//! - `GET /readyz` - readiness check (feed connected)
//! - `GET /stats` - combined cache, session and fan-out statistics
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /ingest` - one `TickEvent` or an array of them (external feed only)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{MarketDataService, ServiceStats};
use crate::domain::market::TickEvent;
use crate::infrastructure::broadcast::{SharedTopicHub, TopicHubStats};
use crate::infrastructure::feed::{ConnectionState, FeedEvent, FeedSender, FeedState, FeedStatus};
use crate::infrastructure::metrics::{
    get_metrics_handle, publish_cache_stats, publish_session_stats,
};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed.
    pub feed: FeedStatus,
    /// Outbound topics.
    pub topics: TopicHubStats,
    /// Engine statistics.
    pub stats: ServiceStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed connected.
    Healthy,
    /// Feed down but the cache still serves fresh data.
    Degraded,
    /// Feed down and nothing fresh to serve.
    Unhealthy,
}

/// Body accepted by `POST /ingest`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestBatch {
    One(Box<TickEvent>),
    Many(Vec<TickEvent>),
}

impl IngestBatch {
    fn into_ticks(self) -> Vec<TickEvent> {
        match self {
            Self::One(tick) => vec![*tick],
            Self::Many(ticks) => ticks,
        }
    }
}

/// Reply to an accepted ingest.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestResponse {
    /// Ticks queued for the cache.
    pub accepted: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: Arc<FeedState>,
    service: MarketDataService,
    hub: SharedTopicHub,
    ingest: Option<FeedSender>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        feed: Arc<FeedState>,
        service: MarketDataService,
        hub: SharedTopicHub,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
            service,
            hub,
            ingest: None,
        }
    }

    /// Accept ticks on `POST /ingest` and forward them to `sender`.
    #[must_use]
    pub fn with_ingest(mut self, sender: FeedSender) -> Self {
        self.ingest = Some(sender);
        self
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the endpoint router.
///
/// `/ingest` is only routed when the state carries a feed sender.
pub fn router(state: Arc<HealthServerState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler));
    if state.ingest.is_some() {
        router = router.route("/ingest", post(ingest_handler));
    }
    router.with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
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

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.feed.is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn stats_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.service.stats())
}

async fn metrics_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let stats = state.service.stats();
            publish_cache_stats(&stats.cache);
            publish_session_stats(&stats.sessions);
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn ingest_handler(
    State(state): State<Arc<HealthServerState>>,
    Json(batch): Json<IngestBatch>,
) -> Response {
    let Some(sender) = state.ingest.as_ref() else {
        return (StatusCode::NOT_FOUND, "Ingest disabled").into_response();
    };
    let feed_closed = || (StatusCode::SERVICE_UNAVAILABLE, "Feed closed").into_response();

    if !state.feed.is_connected() && sender.send(FeedEvent::Connected).await.is_err() {
        return feed_closed();
    }

    let ticks = batch.into_ticks();
    let accepted = ticks.len();
    for tick in ticks {
        if sender.send(FeedEvent::from(tick)).await.is_err() {
            tracing::warn!("Ingest rejected, feed channel closed");
            return feed_closed();
        }
    }

    tracing::trace!(accepted, "Ingested ticks");
    (StatusCode::ACCEPTED, Json(IngestResponse { accepted })).into_response()
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feed = state.feed.status();
    let stats = state.service.stats();
    let status = determine_health_status(feed.state, stats.cache.active_instruments);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        topics: state.hub.stats(),
        stats,
    }
}

const fn determine_health_status(feed: ConnectionState, active_instruments: usize) -> HealthStatus {
    match feed {
        ConnectionState::Connected => HealthStatus::Healthy,
        _ if active_instruments > 0 => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
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
