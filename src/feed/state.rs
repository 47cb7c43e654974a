//! Process-wide realtime feed state.
//!
//! Owns the current snapshot per source plus per-source health bookkeeping.
//! Snapshots are replaced atomically; readers hold `Arc`s to whatever was
//! current when they looked, so a slow reader never sees a half-written
//! snapshot. Created at startup, torn down with the process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;
use utoipa::ToSchema;

use super::types::{EntityPayload, FeedEntity, FeedKind, FeedSnapshot};

/// Health of an upstream source as seen by its polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    /// Repeated consecutive failures; polled at a widened interval.
    Degraded,
}

/// Per-source polling status, exposed via the health endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SourceStatus {
    pub source_id: String,
    pub health: SourceHealth,
    pub last_sequence: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

pub type SharedFeedState = Arc<FeedStateStore>;

/// Store of the latest accepted snapshot per source.
pub struct FeedStateStore {
    snapshots: RwLock<HashMap<String, Arc<FeedSnapshot>>>,
    statuses: RwLock<HashMap<String, SourceStatus>>,
}

impl FeedStateStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Register a configured source so it shows up in status reports before
    /// its first successful poll.
    pub async fn register_source(&self, source_id: &str) {
        let mut statuses = self.statuses.write().await;
        statuses
            .entry(source_id.to_string())
            .or_insert_with(|| SourceStatus {
                source_id: source_id.to_string(),
                health: SourceHealth::Healthy,
                last_sequence: 0,
                last_success: None,
                consecutive_failures: 0,
            });
    }

    /// Accept a snapshot if it advances the source's sequence.
    ///
    /// Returns the shared snapshot on acceptance, or `None` when the sequence
    /// does not move forward (a stale or duplicate delivery, e.g. from a
    /// retried request finishing late). Rejected snapshots leave the previous
    /// one authoritative.
    pub async fn accept(&self, snapshot: FeedSnapshot) -> Option<Arc<FeedSnapshot>> {
        let mut snapshots = self.snapshots.write().await;

        if let Some(current) = snapshots.get(&snapshot.source_id) {
            if snapshot.sequence <= current.sequence {
                warn!(
                    source = %snapshot.source_id,
                    sequence = snapshot.sequence,
                    current = current.sequence,
                    "Discarding out-of-order snapshot"
                );
                return None;
            }
        }

        let snapshot = Arc::new(snapshot);
        snapshots.insert(snapshot.source_id.clone(), snapshot.clone());

        // Status follows under the same snapshot guard so it can never
        // report a sequence the store does not hold yet
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&snapshot.source_id) {
            status.last_sequence = snapshot.sequence;
        }

        Some(snapshot)
    }

    /// Latest accepted snapshot for a source.
    pub async fn current(&self, source_id: &str) -> Option<Arc<FeedSnapshot>> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(source_id).cloned()
    }

    /// Latest accepted snapshot of every source.
    pub async fn all_snapshots(&self) -> Vec<Arc<FeedSnapshot>> {
        let snapshots = self.snapshots.read().await;
        snapshots.values().cloned().collect()
    }

    pub async fn record_success(&self, source_id: &str) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(source_id) {
            status.health = SourceHealth::Healthy;
            status.consecutive_failures = 0;
            status.last_success = Some(Utc::now());
        }
    }

    /// Record a failed poll; returns the new consecutive failure count.
    pub async fn record_failure(&self, source_id: &str) -> u32 {
        let mut statuses = self.statuses.write().await;
        match statuses.get_mut(source_id) {
            Some(status) => {
                status.consecutive_failures += 1;
                status.consecutive_failures
            }
            None => 0,
        }
    }

    pub async fn mark_degraded(&self, source_id: &str) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(source_id) {
            status.health = SourceHealth::Degraded;
        }
    }

    pub async fn statuses(&self) -> Vec<SourceStatus> {
        let statuses = self.statuses.read().await;
        let mut list: Vec<SourceStatus> = statuses.values().cloned().collect();
        list.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        list
    }

    /// Current realtime delay for a (trip, stop) pair, in seconds.
    ///
    /// Scans trip-update snapshots across sources; a per-stop departure delay
    /// wins over an arrival delay, which wins over the trip-level delay.
    pub async fn delay_for(&self, trip_id: &str, stop_id: &str) -> Option<i32> {
        let snapshots = self.snapshots.read().await;

        for snapshot in snapshots.values() {
            if snapshot.feed_kind != FeedKind::TripUpdates {
                continue;
            }
            for entity in &snapshot.entities {
                if entity.trip_id.as_deref() != Some(trip_id) {
                    continue;
                }
                if let Some(delay) = entity_delay_at_stop(entity, stop_id) {
                    return Some(delay);
                }
            }
        }

        None
    }
}

impl Default for FeedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn entity_delay_at_stop(entity: &FeedEntity, stop_id: &str) -> Option<i32> {
    let EntityPayload::TripUpdate {
        delay_seconds,
        stop_delays,
    } = &entity.payload
    else {
        return None;
    };

    for stop_delay in stop_delays {
        if stop_delay.stop_id == stop_id {
            return stop_delay
                .departure_delay_seconds
                .or(stop_delay.arrival_delay_seconds)
                .or(*delay_seconds);
        }
    }

    *delay_seconds
}
