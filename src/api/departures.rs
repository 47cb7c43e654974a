use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

use crate::api::ErrorResponse;
use crate::service::{DepartureBoard, DepartureQueryParams, DepartureQueryService, QueryError};
use crate::storage::ScheduleError;

#[derive(Clone)]
pub struct DeparturesState {
    pub service: Arc<DepartureQueryService>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DeparturesRequest {
    /// Stop identifier (must exist in the schedule for the chosen feed)
    pub stop_id: String,
    /// Feed identifier (defaults to the configured feed)
    pub feed_id: Option<String>,
    /// Service date (YYYY-MM-DD, defaults to today)
    pub date: Option<String>,
    /// Start time (HH:MM or HH:MM:SS, defaults to now)
    pub time: Option<String>,
    /// Number of results (default 10, max 100)
    pub limit: Option<u32>,
}

/// Next scheduled departures at a stop, with live delays when known
#[utoipa::path(
    get,
    path = "/api/departures",
    params(DeparturesRequest),
    responses(
        (status = 200, description = "Departure board for the stop", body = DepartureBoard),
        (status = 400, description = "Invalid parameters", body = ErrorResponse),
        (status = 404, description = "Unknown feed or stop", body = ErrorResponse),
        (status = 501, description = "Selected schedule backend not implemented", body = ErrorResponse),
        (status = 503, description = "Schedule store unavailable", body = ErrorResponse)
    ),
    tag = "departures"
)]
pub async fn get_departures(
    State(state): State<DeparturesState>,
    Query(request): Query<DeparturesRequest>,
) -> Result<Json<DepartureBoard>, (StatusCode, Json<ErrorResponse>)> {
    let params = DepartureQueryParams {
        feed_id: request.feed_id,
        stop_id: request.stop_id,
        date: request.date,
        time: request.time,
        limit: request.limit,
    };

    let board = state
        .service
        .departures(params)
        .await
        .map_err(query_error_response)?;

    Ok(Json(board))
}

fn query_error_response(error: QueryError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        QueryError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        QueryError::Schedule(ScheduleError::NotFound(_)) => StatusCode::NOT_FOUND,
        QueryError::Schedule(ScheduleError::NotImplemented(_)) => StatusCode::NOT_IMPLEMENTED,
        QueryError::Schedule(ScheduleError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ErrorResponse::new(error.to_string())))
}

pub fn router(service: Arc<DepartureQueryService>) -> Router {
    let state = DeparturesState { service };
    Router::new()
        .route("/", get(get_departures))
        .with_state(state)
}
