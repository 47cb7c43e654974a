use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::fanout::FanoutHub;
use crate::feed::state::{SharedFeedState, SourceStatus};

#[derive(Clone)]
pub struct HealthState {
    pub feed_state: SharedFeedState,
    pub hub: Arc<FanoutHub>,
    pub schedule_backend: &'static str,
    pub cache_enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Which schedule store backend is configured
    pub schedule_backend: String,
    /// Whether schedule queries go through the read-through cache
    pub cache_enabled: bool,
    /// Number of connected realtime subscribers
    pub subscriber_count: usize,
    /// Per-source feed polling status
    pub sources: Vec<SourceStatus>,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        schedule_backend: state.schedule_backend.to_string(),
        cache_enabled: state.cache_enabled,
        subscriber_count: state.hub.subscriber_count().await,
        sources: state.feed_state.statuses().await,
    })
}

pub fn router(
    feed_state: SharedFeedState,
    hub: Arc<FanoutHub>,
    schedule_backend: &'static str,
    cache_enabled: bool,
) -> Router {
    let state = HealthState {
        feed_state,
        hub,
        schedule_backend,
        cache_enabled,
    };
    Router::new()
        .route("/", get(health_check))
        .with_state(state)
}
