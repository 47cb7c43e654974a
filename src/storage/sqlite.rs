//! SQLite-backed schedule repository.
//!
//! Reads the schedule tables maintained by the external import pipeline
//! (feeds, stops, routes, trips, stop_times). This repository only ever
//! reads; schema and content ownership stay with the importer.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{DepartureQuery, DepartureRecord, ScheduleError, ScheduleRepository};

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    /// Open the database file. Fails with `Unavailable` when the file cannot
    /// be opened; a missing schedule database is an operational problem, not
    /// a caller error.
    pub async fn connect(path: &str) -> Result<Self, ScheduleError> {
        let url = format!("sqlite:{path}");
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| ScheduleError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DepartureRow {
    route_id: String,
    route_short_name: Option<String>,
    route_long_name: Option<String>,
    trip_id: String,
    stop_id: String,
    trip_headsign: Option<String>,
    direction_id: Option<i64>,
    arrival_time: Option<String>,
    departure_time: Option<String>,
}

impl From<DepartureRow> for DepartureRecord {
    fn from(row: DepartureRow) -> Self {
        DepartureRecord {
            route_id: row.route_id,
            route_short_name: row.route_short_name,
            route_long_name: row.route_long_name,
            trip_id: row.trip_id,
            stop_id: row.stop_id,
            headsign: row.trip_headsign,
            direction_id: row.direction_id.map(|d| d as i32),
            arrival_time: row.arrival_time,
            departure_time: row.departure_time,
            realtime_delay_seconds: None,
        }
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn next_departures(
        &self,
        query: &DepartureQuery,
    ) -> Result<Vec<DepartureRecord>, ScheduleError> {
        let unavailable = |e: sqlx::Error| ScheduleError::Unavailable(e.to_string());

        let feed_exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM feeds WHERE feed_id = ?")
                .bind(&query.feed_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        if feed_exists.is_none() {
            return Err(ScheduleError::NotFound(format!(
                "feed_id '{}' not found",
                query.feed_id
            )));
        }

        let stop_exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM stops WHERE feed_id = ? AND stop_id = ?")
                .bind(&query.feed_id)
                .bind(&query.stop_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        if stop_exists.is_none() {
            return Err(ScheduleError::NotFound(format!(
                "stop_id '{}' not found for feed '{}'",
                query.stop_id, query.feed_id
            )));
        }

        // Times are zero-padded "HH:MM:SS" text, so lexicographic comparison
        // matches chronological order. Service-day calendar exceptions are
        // not applied here; the import pipeline publishes one service day at
        // a time.
        let from_time = query.from_time.format("%H:%M:%S").to_string();
        let rows: Vec<DepartureRow> = sqlx::query_as(
            r#"
            SELECT
                t.route_id,
                r.route_short_name,
                r.route_long_name,
                st.trip_id,
                st.stop_id,
                t.trip_headsign,
                t.direction_id,
                st.arrival_time,
                st.departure_time
            FROM stop_times st
            JOIN trips t ON t.feed_id = st.feed_id AND t.trip_id = st.trip_id
            LEFT JOIN routes r ON r.feed_id = st.feed_id AND r.route_id = t.route_id
            WHERE st.feed_id = ?
              AND st.stop_id = ?
              AND st.departure_time IS NOT NULL
              AND st.departure_time >= ?
            ORDER BY st.departure_time, st.trip_id
            LIMIT ?
            "#,
        )
        .bind(&query.feed_id)
        .bind(&query.stop_id)
        .bind(&from_time)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows.into_iter().map(DepartureRecord::from).collect())
    }
}
