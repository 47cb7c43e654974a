pub mod departures;
pub mod error;
pub mod health;
pub mod ws;

pub use error::{internal_error, ErrorResponse};

use std::collections::HashMap;
use std::sync::Arc;

use axum::{routing::get, Router};

use crate::config::{Config, ScheduleBackend};
use crate::fanout::FanoutHub;
use crate::feed::state::SharedFeedState;
use crate::service::DepartureQueryService;

pub fn router(
    config: &Config,
    query_service: Arc<DepartureQueryService>,
    feed_state: SharedFeedState,
    hub: Arc<FanoutHub>,
) -> Router {
    let screens: HashMap<_, _> = config
        .screens
        .iter()
        .map(|s| (s.screen_id.clone(), s.clone()))
        .collect();
    let ws_state = ws::WsState {
        hub: hub.clone(),
        screens: Arc::new(screens),
    };

    let schedule_backend = match config.schedule.backend {
        ScheduleBackend::Sqlite => "sqlite",
        ScheduleBackend::Sparql => "sparql",
    };

    Router::new()
        .nest("/departures", departures::router(query_service))
        .nest(
            "/health",
            health::router(feed_state, hub, schedule_backend, config.cache.enabled),
        )
        .route("/ws", get(ws::ws_updates).with_state(ws_state))
}
