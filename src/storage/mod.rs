//! Schedule data access.
//!
//! `ScheduleRepository` is the one contract every backend satisfies; callers
//! hold an `Arc<dyn ScheduleRepository>` and never learn which store is
//! behind it. Backend selection happens once, at configuration time, in
//! [`build_repository`]. The cache wrapper implements the same trait, so
//! caching is a composition decision rather than a separate code path.

pub mod cache;
pub mod sparql;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::{CacheConfig, ScheduleBackend, ScheduleConfig};

use cache::{CachedScheduleRepository, MokaCacheProvider};
use sparql::SparqlScheduleRepository;
use sqlite::SqliteScheduleRepository;

/// A scheduled departure at a stop, optionally overlaid with live delay data.
///
/// Times are "HH:MM:SS" strings in the feed's local time, as published by
/// the schedule itself; the hub never converts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DepartureRecord {
    pub route_id: String,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub trip_id: String,
    pub stop_id: String,
    pub headsign: Option<String>,
    pub direction_id: Option<i32>,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    /// Live delay in seconds for this trip at this stop, when a matching
    /// trip update is currently known. Never persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_delay_seconds: Option<i32>,
}

/// Parameters of one departure lookup. All fields are resolved (no
/// defaults left) by the time a repository sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepartureQuery {
    pub feed_id: String,
    pub stop_id: String,
    pub service_date: NaiveDate,
    pub from_time: NaiveTime,
    pub limit: u32,
}

/// Failures of the schedule data access layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    /// Unknown feed or stop. Surfaced to the caller, never retried.
    #[error("{0}")]
    NotFound(String),
    /// The backing store cannot be reached. The caller decides whether to
    /// retry; the repository itself does not.
    #[error("Schedule backend unavailable: {0}")]
    Unavailable(String),
    /// The selected backend exists in configuration but has no working
    /// implementation.
    #[error("Schedule backend not implemented: {0}")]
    NotImplemented(String),
}

/// Contract for reading scheduled departures.
///
/// Result ordering: departure time ascending, ties broken by trip id; at
/// most `limit` records; an empty Vec (not an error) when nothing is left
/// in the window.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn next_departures(
        &self,
        query: &DepartureQuery,
    ) -> Result<Vec<DepartureRecord>, ScheduleError>;
}

/// Build the repository stack selected by configuration.
///
/// The base backend comes from `schedule.backend`; when caching is enabled
/// it is wrapped in the read-through cache. Call sites only ever see the
/// trait object.
pub async fn build_repository(
    schedule: &ScheduleConfig,
    cache: &CacheConfig,
) -> Result<Arc<dyn ScheduleRepository>, ScheduleError> {
    let base: Arc<dyn ScheduleRepository> = match schedule.backend {
        ScheduleBackend::Sqlite => {
            Arc::new(SqliteScheduleRepository::connect(&schedule.database_path).await?)
        }
        ScheduleBackend::Sparql => Arc::new(SparqlScheduleRepository::new(
            schedule.sparql_endpoint.clone().unwrap_or_default(),
        )),
    };

    if !cache.enabled {
        return Ok(base);
    }

    let provider = Arc::new(MokaCacheProvider::new(cache.max_capacity));
    Ok(Arc::new(CachedScheduleRepository::new(
        base,
        provider,
        Duration::from_secs(cache.ttl_seconds),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScheduleError::NotFound("stop_id 'X' not found for feed 'F'".into());
        assert_eq!(err.to_string(), "stop_id 'X' not found for feed 'F'");

        let err = ScheduleError::Unavailable("connection refused".into());
        assert_eq!(
            err.to_string(),
            "Schedule backend unavailable: connection refused"
        );

        let err = ScheduleError::NotImplemented("sparql".into());
        assert!(err.to_string().contains("not implemented"));
    }

    #[test]
    fn test_departure_record_serialization_omits_missing_delay() {
        let record = DepartureRecord {
            route_id: "R1".into(),
            route_short_name: Some("1".into()),
            route_long_name: None,
            trip_id: "T1".into(),
            stop_id: "STOP_1".into(),
            headsign: Some("Downtown".into()),
            direction_id: Some(0),
            arrival_time: Some("08:05:00".into()),
            departure_time: Some("08:06:00".into()),
            realtime_delay_seconds: None,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("realtime_delay_seconds"));

        let round_tripped: DepartureRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped, record);
    }
}
