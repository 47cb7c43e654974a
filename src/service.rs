//! One-shot departure queries.
//!
//! The request/response counterpart to the push pipeline: validate caller
//! input, resolve defaults, read the (cached) schedule, and overlay live
//! delays from the current realtime state. Subscription handling lives
//! elsewhere; this service owns nothing between calls.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::{QueryConfig, ScheduleConfig};
use crate::feed::state::SharedFeedState;
use crate::storage::{DepartureQuery, DepartureRecord, ScheduleError, ScheduleRepository};

/// Raw caller input, before validation and defaulting.
#[derive(Debug, Clone, Default)]
pub struct DepartureQueryParams {
    pub feed_id: Option<String>,
    pub stop_id: String,
    /// Service date as "YYYY-MM-DD"; defaults to today in the feed timezone.
    pub date: Option<String>,
    /// Start time as "HH:MM" or "HH:MM:SS"; defaults to now in the feed
    /// timezone.
    pub time: Option<String>,
    pub limit: Option<u32>,
}

/// Resolved query echo plus the matching departures.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DepartureBoard {
    pub feed_id: String,
    pub stop_id: String,
    pub service_date: String,
    pub from_time: String,
    pub limit: u32,
    pub departures: Vec<DepartureRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Caller-side problem: malformed or out-of-range input.
    #[error("{0}")]
    InvalidParameter(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

pub struct DepartureQueryService {
    repo: Arc<dyn ScheduleRepository>,
    feed_state: SharedFeedState,
    default_limit: u32,
    max_limit: u32,
    default_feed_id: Option<String>,
    timezone: Tz,
}

impl DepartureQueryService {
    pub fn new(
        repo: Arc<dyn ScheduleRepository>,
        feed_state: SharedFeedState,
        query: &QueryConfig,
        schedule: &ScheduleConfig,
    ) -> Self {
        Self {
            repo,
            feed_state,
            default_limit: query.default_limit,
            max_limit: query.max_limit,
            default_feed_id: schedule.default_feed_id.clone(),
            timezone: schedule.parsed_timezone(),
        }
    }

    pub async fn departures(
        &self,
        params: DepartureQueryParams,
    ) -> Result<DepartureBoard, QueryError> {
        let query = self.resolve(params)?;

        let mut departures = self.repo.next_departures(&query).await?;

        for record in &mut departures {
            if let Some(delay) = self
                .feed_state
                .delay_for(&record.trip_id, &record.stop_id)
                .await
            {
                record.realtime_delay_seconds = Some(delay);
            }
        }

        Ok(DepartureBoard {
            feed_id: query.feed_id,
            stop_id: query.stop_id,
            service_date: query.service_date.format("%Y-%m-%d").to_string(),
            from_time: query.from_time.format("%H:%M:%S").to_string(),
            limit: query.limit,
            departures,
        })
    }

    /// Validate the raw parameters and fill in defaults.
    fn resolve(&self, params: DepartureQueryParams) -> Result<DepartureQuery, QueryError> {
        if params.stop_id.is_empty() {
            return Err(QueryError::InvalidParameter("stop_id is required".into()));
        }

        let feed_id = match params.feed_id {
            Some(feed_id) if !feed_id.is_empty() => feed_id,
            _ => self.default_feed_id.clone().ok_or_else(|| {
                QueryError::Schedule(ScheduleError::NotFound(
                    "no default feed configured; pass feed_id explicitly".into(),
                ))
            })?,
        };

        let limit = params.limit.unwrap_or(self.default_limit);
        if limit == 0 || limit > self.max_limit {
            return Err(QueryError::InvalidParameter(format!(
                "limit must be between 1 and {}",
                self.max_limit
            )));
        }

        let now = Utc::now().with_timezone(&self.timezone);

        let service_date = match params.date.as_deref() {
            Some(date) => NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                QueryError::InvalidParameter("Invalid date format. Use YYYY-MM-DD".into())
            })?,
            None => now.date_naive(),
        };

        let from_time = match params.time.as_deref() {
            Some(time) => {
                let format = if time.split(':').count() == 3 {
                    "%H:%M:%S"
                } else {
                    "%H:%M"
                };
                NaiveTime::parse_from_str(time, format).map_err(|_| {
                    QueryError::InvalidParameter("Invalid time format. Use HH:MM or HH:MM:SS".into())
                })?
            }
            None => now.time(),
        };

        Ok(DepartureQuery {
            feed_id,
            stop_id: params.stop_id,
            service_date,
            from_time,
            limit,
        })
    }
}
