//! Relevance classification of realtime entities against subscriber filters.
//!
//! Everything in this module is pure: no I/O, no clocks, no shared state.
//! Given the same snapshot and the same delivered state, the computed delta
//! is identical, which lets the fanout hub re-run classification freely
//! (e.g. when rebuilding a subscriber after a resync).

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::feed::types::{EntityPayload, FeedEntity, FeedKind, FeedSnapshot};

/// What one subscriber wants to hear about.
///
/// An entity is relevant when its stop set intersects `stop_ids` or any of
/// its routes appears in `route_ids`. Alerts carry their informed stops and
/// routes in the same sets, so the one rule covers all three entity kinds.
/// `screen_id` records which configured screen the sets were resolved from,
/// if any; matching never looks at it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub stop_ids: HashSet<String>,
    #[serde(default)]
    pub route_ids: HashSet<String>,
    #[serde(default)]
    pub screen_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn matches(&self, entity: &FeedEntity) -> bool {
        if !self.stop_ids.is_disjoint(&entity.stop_ids) {
            return true;
        }
        entity.route_ids.iter().any(|r| self.route_ids.contains(r))
    }

    /// A filter with no stops and no routes matches nothing.
    pub fn is_empty(&self) -> bool {
        self.stop_ids.is_empty() && self.route_ids.is_empty()
    }
}

/// What a subscriber has already received from one source: entity id mapped
/// to a content hash of the delivered version.
#[derive(Debug, Clone, Default)]
pub struct DeliveredState {
    hashes: HashMap<String, u64>,
}

impl DeliveredState {
    /// State after a full snapshot delivery of the given entities.
    pub fn from_entities(entities: &[FeedEntity]) -> Self {
        let hashes = entities
            .iter()
            .map(|e| (e.entity_id.clone(), entity_hash(e)))
            .collect();
        Self { hashes }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// The minimal change set for one subscriber from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EntityDelta {
    pub source_id: String,
    pub feed_kind: FeedKind,
    /// Sequence of the snapshot this delta was computed from.
    pub sequence: u64,
    pub added: Vec<FeedEntity>,
    pub updated: Vec<FeedEntity>,
    /// Entity ids that were delivered before but are gone from the current
    /// relevant set.
    pub removed: Vec<String>,
}

impl EntityDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Compute the delta a subscriber needs to go from `delivered` to the
/// relevant portion of `snapshot`.
pub fn relevant_delta(
    snapshot: &FeedSnapshot,
    filter: &SubscriptionFilter,
    delivered: &DeliveredState,
) -> EntityDelta {
    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for entity in &snapshot.entities {
        if !filter.matches(entity) {
            continue;
        }
        seen.insert(entity.entity_id.as_str());

        match delivered.hashes.get(&entity.entity_id) {
            Some(&old_hash) if old_hash == entity_hash(entity) => {
                // Unchanged since last delivery
            }
            Some(_) => updated.push(entity.clone()),
            None => added.push(entity.clone()),
        }
    }

    let mut removed: Vec<String> = delivered
        .hashes
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    removed.sort();

    EntityDelta {
        source_id: snapshot.source_id.clone(),
        feed_kind: snapshot.feed_kind,
        sequence: snapshot.sequence,
        added,
        updated,
        removed,
    }
}

/// Advance delivered state past a delta that was handed to the subscriber.
pub fn apply_delta(delivered: &mut DeliveredState, delta: &EntityDelta) {
    for entity in delta.added.iter().chain(delta.updated.iter()) {
        delivered
            .hashes
            .insert(entity.entity_id.clone(), entity_hash(entity));
    }
    for id in &delta.removed {
        delivered.hashes.remove(id);
    }
}

/// The entities of a snapshot a filter cares about, in snapshot order.
pub fn relevant_entities(snapshot: &FeedSnapshot, filter: &SubscriptionFilter) -> Vec<FeedEntity> {
    snapshot
        .entities
        .iter()
        .filter(|e| filter.matches(e))
        .cloned()
        .collect()
}

/// Content hash of an entity for change detection.
fn entity_hash(entity: &FeedEntity) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    entity.entity_id.hash(&mut hasher);
    entity.trip_id.hash(&mut hasher);

    let mut stops: Vec<&String> = entity.stop_ids.iter().collect();
    stops.sort();
    stops.hash(&mut hasher);
    let mut routes: Vec<&String> = entity.route_ids.iter().collect();
    routes.sort();
    routes.hash(&mut hasher);

    match &entity.payload {
        EntityPayload::VehiclePosition {
            latitude,
            longitude,
            bearing,
            timestamp,
        } => {
            latitude.to_bits().hash(&mut hasher);
            longitude.to_bits().hash(&mut hasher);
            bearing.map(f32::to_bits).hash(&mut hasher);
            timestamp.hash(&mut hasher);
        }
        EntityPayload::TripUpdate {
            delay_seconds,
            stop_delays,
        } => {
            delay_seconds.hash(&mut hasher);
            for sd in stop_delays {
                sd.stop_id.hash(&mut hasher);
                sd.arrival_delay_seconds.hash(&mut hasher);
                sd.departure_delay_seconds.hash(&mut hasher);
            }
        }
        EntityPayload::Alert {
            header,
            description,
            severity,
        } => {
            header.hash(&mut hasher);
            description.hash(&mut hasher);
            (*severity as u8).hash(&mut hasher);
        }
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entity(id: &str, trip: Option<&str>, routes: &[&str], stops: &[&str]) -> FeedEntity {
        FeedEntity {
            entity_id: id.to_string(),
            trip_id: trip.map(str::to_string),
            route_ids: routes.iter().map(|s| s.to_string()).collect(),
            stop_ids: stops.iter().map(|s| s.to_string()).collect(),
            payload: EntityPayload::TripUpdate {
                delay_seconds: Some(0),
                stop_delays: vec![],
            },
            source_sequence: 1,
        }
    }

    fn entity_with_delay(id: &str, stops: &[&str], delay: i32) -> FeedEntity {
        FeedEntity {
            payload: EntityPayload::TripUpdate {
                delay_seconds: Some(delay),
                stop_delays: vec![],
            },
            ..entity(id, Some("T1"), &[], stops)
        }
    }

    fn snapshot(sequence: u64, entities: Vec<FeedEntity>) -> FeedSnapshot {
        FeedSnapshot {
            source_id: "src".to_string(),
            feed_kind: FeedKind::TripUpdates,
            fetched_at: Utc::now(),
            sequence,
            entities,
        }
    }

    fn stop_filter(stops: &[&str]) -> SubscriptionFilter {
        SubscriptionFilter {
            stop_ids: stops.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_matches_on_stop_intersection() {
        let filter = stop_filter(&["STOP_1", "STOP_2"]);
        assert!(filter.matches(&entity("e", None, &[], &["STOP_2", "STOP_9"])));
        assert!(!filter.matches(&entity("e", None, &[], &["STOP_8", "STOP_9"])));
    }

    #[test]
    fn test_filter_matches_on_route_membership() {
        let filter = SubscriptionFilter {
            route_ids: ["R1".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(filter.matches(&entity("e", None, &["R1"], &[])));
        assert!(!filter.matches(&entity("e", None, &["R2"], &[])));
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let filter = SubscriptionFilter::default();
        assert!(filter.is_empty());
        assert!(!filter.matches(&entity("e", None, &["R1"], &["STOP_1"])));
    }

    #[test]
    fn test_delta_add_update_remove() {
        let filter = stop_filter(&["STOP_1"]);

        let first = snapshot(
            1,
            vec![
                entity_with_delay("a", &["STOP_1"], 0),
                entity_with_delay("b", &["STOP_1"], 0),
                // Not relevant to the filter
                entity_with_delay("c", &["STOP_9"], 0),
            ],
        );
        let delta1 = relevant_delta(&first, &filter, &DeliveredState::default());
        assert_eq!(delta1.added.len(), 2);
        assert!(delta1.updated.is_empty());
        assert!(delta1.removed.is_empty());

        let mut delivered = DeliveredState::default();
        apply_delta(&mut delivered, &delta1);
        assert_eq!(delivered.len(), 2);

        // "a" changes, "b" disappears, "d" is new
        let second = snapshot(
            2,
            vec![
                entity_with_delay("a", &["STOP_1"], 120),
                entity_with_delay("d", &["STOP_1"], 0),
            ],
        );
        let delta2 = relevant_delta(&second, &filter, &delivered);
        assert_eq!(delta2.added.len(), 1);
        assert_eq!(delta2.added[0].entity_id, "d");
        assert_eq!(delta2.updated.len(), 1);
        assert_eq!(delta2.updated[0].entity_id, "a");
        assert_eq!(delta2.removed, vec!["b".to_string()]);
    }

    #[test]
    fn test_unchanged_entity_produces_empty_delta() {
        let filter = stop_filter(&["STOP_1"]);
        let first = snapshot(1, vec![entity_with_delay("a", &["STOP_1"], 30)]);

        let mut delivered = DeliveredState::default();
        apply_delta(&mut delivered, &relevant_delta(&first, &filter, &delivered.clone()));

        // Same content under a new sequence number
        let second = snapshot(2, vec![entity_with_delay("a", &["STOP_1"], 30)]);
        let delta = relevant_delta(&second, &filter, &delivered);
        assert!(delta.is_empty());
        assert_eq!(delta.sequence, 2);
    }

    #[test]
    fn test_delta_is_deterministic() {
        let filter = stop_filter(&["STOP_1", "STOP_2"]);
        let snap = snapshot(
            3,
            vec![
                entity_with_delay("a", &["STOP_1"], 10),
                entity_with_delay("b", &["STOP_2"], 20),
                entity_with_delay("c", &["STOP_1", "STOP_2"], 30),
            ],
        );
        let delivered = DeliveredState::from_entities(&[
            entity_with_delay("a", &["STOP_1"], 5),
            entity_with_delay("z", &["STOP_1"], 5),
        ]);

        let d1 = relevant_delta(&snap, &filter, &delivered);
        let d2 = relevant_delta(&snap, &filter, &delivered);
        assert_eq!(d1, d2);
        assert_eq!(d1.updated[0].entity_id, "a");
        assert_eq!(d1.removed, vec!["z".to_string()]);
    }

    #[test]
    fn test_relevant_entities_preserves_snapshot_order() {
        let filter = stop_filter(&["STOP_1"]);
        let snap = snapshot(
            1,
            vec![
                entity_with_delay("b", &["STOP_1"], 0),
                entity_with_delay("a", &["STOP_1"], 0),
                entity_with_delay("x", &["STOP_9"], 0),
            ],
        );
        let relevant = relevant_entities(&snap, &filter);
        let ids: Vec<&str> = relevant.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
