//! Normalized realtime feed entities.
//!
//! One polling cycle of one source produces a [`FeedSnapshot`]: the full set
//! of entities the source currently publishes, stamped with a per-source
//! sequence number. Snapshots are immutable once built and replace each other
//! wholesale; individual entities are never patched in place.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// What kind of realtime records a source publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Alerts,
    TripUpdates,
    VehiclePositions,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Alerts => "alerts",
            FeedKind::TripUpdates => "trip_updates",
            FeedKind::VehiclePositions => "vehicle_positions",
        }
    }
}

/// Alert severity, mapped from the GTFS-RT severity_level enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Unknown,
    Info,
    Warning,
    Severe,
}

impl AlertSeverity {
    fn from_severity_level(level: Option<i32>) -> Self {
        match level {
            Some(2) => AlertSeverity::Info,
            Some(3) => AlertSeverity::Warning,
            Some(4) => AlertSeverity::Severe,
            _ => AlertSeverity::Unknown,
        }
    }
}

/// Delay information for one stop of a trip update.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StopDelay {
    pub stop_id: String,
    pub arrival_delay_seconds: Option<i32>,
    pub departure_delay_seconds: Option<i32>,
}

/// Kind-specific content of a realtime entity.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum EntityPayload {
    VehiclePosition {
        latitude: f32,
        longitude: f32,
        bearing: Option<f32>,
        /// POSIX timestamp of the position measurement, if reported.
        timestamp: Option<u64>,
    },
    TripUpdate {
        /// Trip-level delay in seconds, used when a stop has no own delay.
        delay_seconds: Option<i32>,
        stop_delays: Vec<StopDelay>,
    },
    Alert {
        header: String,
        description: Option<String>,
        severity: AlertSeverity,
    },
}

/// One realtime record, normalized from the upstream wire format.
///
/// `stop_ids` and `route_ids` hold every stop/route the entity refers to:
/// the visited stops of a trip update, the current stop of a vehicle, the
/// informed entities of an alert. Relevance filtering only looks at these
/// two sets plus `trip_id`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FeedEntity {
    pub entity_id: String,
    pub trip_id: Option<String>,
    #[serde(skip_serializing_if = "HashSet::is_empty")]
    pub route_ids: HashSet<String>,
    #[serde(skip_serializing_if = "HashSet::is_empty")]
    pub stop_ids: HashSet<String>,
    pub payload: EntityPayload,
    /// Sequence number of the snapshot this entity version belongs to.
    pub source_sequence: u64,
}

/// Full published state of one source after one polling cycle.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FeedSnapshot {
    pub source_id: String,
    pub feed_kind: FeedKind,
    pub fetched_at: DateTime<Utc>,
    /// Strictly increasing per source. Snapshots that do not advance it are
    /// discarded by the state store.
    pub sequence: u64,
    pub entities: Vec<FeedEntity>,
}

/// Normalize a decoded GTFS-RT message into a snapshot.
///
/// Entities that do not carry the record kind the source is configured for
/// are skipped; deleted entities are dropped (absence from the snapshot is
/// what signals removal downstream).
pub fn normalize_feed(
    source_id: &str,
    kind: FeedKind,
    sequence: u64,
    fetched_at: DateTime<Utc>,
    feed: &gtfs_realtime::FeedMessage,
) -> FeedSnapshot {
    let mut entities = Vec::with_capacity(feed.entity.len());

    for entity in &feed.entity {
        if entity.is_deleted.unwrap_or(false) {
            continue;
        }

        let normalized = match kind {
            FeedKind::TripUpdates => entity
                .trip_update
                .as_ref()
                .map(|tu| normalize_trip_update(&entity.id, tu, sequence)),
            FeedKind::VehiclePositions => entity
                .vehicle
                .as_ref()
                .and_then(|vp| normalize_vehicle_position(&entity.id, vp, sequence)),
            FeedKind::Alerts => entity
                .alert
                .as_ref()
                .map(|alert| normalize_alert(&entity.id, alert, sequence)),
        };

        if let Some(normalized) = normalized {
            entities.push(normalized);
        }
    }

    FeedSnapshot {
        source_id: source_id.to_string(),
        feed_kind: kind,
        fetched_at,
        sequence,
        entities,
    }
}

fn normalize_trip_update(
    entity_id: &str,
    tu: &gtfs_realtime::TripUpdate,
    sequence: u64,
) -> FeedEntity {
    let mut stop_ids = HashSet::new();
    let mut stop_delays = Vec::new();

    for stu in &tu.stop_time_update {
        // Skipped stops carry no usable times
        if stu.schedule_relationship == Some(1) {
            continue;
        }
        let Some(stop_id) = stu.stop_id.as_deref() else {
            continue;
        };
        stop_ids.insert(stop_id.to_string());
        stop_delays.push(StopDelay {
            stop_id: stop_id.to_string(),
            arrival_delay_seconds: stu.arrival.as_ref().and_then(|e| e.delay),
            departure_delay_seconds: stu.departure.as_ref().and_then(|e| e.delay),
        });
    }

    let route_ids = tu
        .trip
        .route_id
        .iter()
        .cloned()
        .collect::<HashSet<String>>();

    FeedEntity {
        entity_id: entity_id.to_string(),
        trip_id: tu.trip.trip_id.clone(),
        route_ids,
        stop_ids,
        payload: EntityPayload::TripUpdate {
            delay_seconds: tu.delay,
            stop_delays,
        },
        source_sequence: sequence,
    }
}

fn normalize_vehicle_position(
    entity_id: &str,
    vp: &gtfs_realtime::VehiclePosition,
    sequence: u64,
) -> Option<FeedEntity> {
    // A vehicle without a position tells subscribers nothing
    let position = vp.position.as_ref()?;

    let trip_id = vp.trip.as_ref().and_then(|t| t.trip_id.clone());
    let route_ids = vp
        .trip
        .as_ref()
        .and_then(|t| t.route_id.clone())
        .into_iter()
        .collect::<HashSet<String>>();
    let stop_ids = vp.stop_id.iter().cloned().collect::<HashSet<String>>();

    Some(FeedEntity {
        entity_id: entity_id.to_string(),
        trip_id,
        route_ids,
        stop_ids,
        payload: EntityPayload::VehiclePosition {
            latitude: position.latitude,
            longitude: position.longitude,
            bearing: position.bearing,
            timestamp: vp.timestamp,
        },
        source_sequence: sequence,
    })
}

fn normalize_alert(entity_id: &str, alert: &gtfs_realtime::Alert, sequence: u64) -> FeedEntity {
    let mut stop_ids = HashSet::new();
    let mut route_ids = HashSet::new();
    let mut trip_id = None;

    for informed in &alert.informed_entity {
        if let Some(stop_id) = &informed.stop_id {
            stop_ids.insert(stop_id.clone());
        }
        if let Some(route_id) = &informed.route_id {
            route_ids.insert(route_id.clone());
        }
        if trip_id.is_none() {
            if let Some(trip) = &informed.trip {
                trip_id = trip.trip_id.clone();
            }
        }
    }

    FeedEntity {
        entity_id: entity_id.to_string(),
        trip_id,
        route_ids,
        stop_ids,
        payload: EntityPayload::Alert {
            header: first_translation(alert.header_text.as_ref()),
            description: Some(first_translation(alert.description_text.as_ref()))
                .filter(|s| !s.is_empty()),
            severity: AlertSeverity::from_severity_level(alert.severity_level),
        },
        source_sequence: sequence,
    }
}

fn first_translation(text: Option<&gtfs_realtime::TranslatedString>) -> String {
    text.and_then(|t| t.translation.first())
        .map(|t| t.text.clone())
        .unwrap_or_default()
}
