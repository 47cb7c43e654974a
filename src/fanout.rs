//! Fan-out of classified realtime deltas to connected subscribers.
//!
//! The hub owns all subscription state. Transport adapters (the websocket
//! handler) only subscribe, receive messages, and unsubscribe; they never
//! touch delivery bookkeeping. Each subscriber has a bounded outbound queue
//! drained by its own receive loop, so a stalled client can only lose its
//! own backlog, never hold up publication to anyone else.
//!
//! Delivery rules per subscriber and source:
//! - deltas are applied in snapshot-sequence order; duplicates and stale
//!   sequences are dropped
//! - a delta arriving ahead of the expected sequence is parked in a small
//!   reorder buffer; a gap wider than the buffer forces a full resync
//! - queue overflow drops the oldest buffered message, marks the subscriber
//!   degraded, and turns its next receive into a full resync

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{
    apply_delta, relevant_delta, relevant_entities, DeliveredState, EntityDelta,
    SubscriptionFilter,
};
use crate::config::FanoutConfig;
use crate::feed::state::SharedFeedState;
use crate::feed::types::{FeedEntity, FeedSnapshot};

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    /// Unsubscribed but the receiver may still be draining.
    Draining,
    Closed,
}

/// A message queued for one subscriber.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Full current state for the subscriber's filter. Sent once on
    /// subscribe and again whenever the subscriber falls too far behind.
    Snapshot {
        entities: Vec<FeedEntity>,
        resync: bool,
    },
    Delta(EntityDelta),
}

struct SubscriberState {
    filter: SubscriptionFilter,
    connection: ConnectionState,
    queue: VecDeque<OutboundMessage>,
    /// Set on overflow or an unrecoverable sequence gap; the next receive
    /// becomes a full resync instead of the backlog.
    needs_resync: bool,
    degraded: bool,
    /// Per source: what this subscriber has been handed.
    delivered: HashMap<String, DeliveredState>,
    /// Per source: sequence of the last applied snapshot/delta.
    last_seq: HashMap<String, u64>,
    /// Per source: deltas that arrived ahead of the expected sequence.
    pending: HashMap<String, BTreeMap<u64, EntityDelta>>,
}

struct SubscriberShared {
    state: Mutex<SubscriberState>,
    notify: Notify,
}

/// Receiving side of a subscription, handed to the transport adapter.
pub struct SubscriberReceiver {
    subscriber_id: Uuid,
    shared: Arc<SubscriberShared>,
    feed_state: SharedFeedState,
}

impl SubscriberReceiver {
    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    /// Next message for this subscriber; waits until one is available.
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<OutboundMessage> {
        loop {
            {
                let mut state = self.shared.state.lock().await;

                if state.needs_resync {
                    let message = rebuild_from_current_state(&mut state, &self.feed_state).await;
                    return Some(message);
                }

                if let Some(message) = state.queue.pop_front() {
                    return Some(message);
                }

                if matches!(
                    state.connection,
                    ConnectionState::Draining | ConnectionState::Closed
                ) {
                    state.connection = ConnectionState::Closed;
                    return None;
                }
            }

            self.shared.notify.notified().await;
        }
    }
}

/// Replace a subscriber's delivery state with the current feed state and
/// produce the corresponding full snapshot message.
async fn rebuild_from_current_state(
    state: &mut SubscriberState,
    feed_state: &SharedFeedState,
) -> OutboundMessage {
    state.queue.clear();
    state.pending.clear();
    state.delivered.clear();
    state.last_seq.clear();

    let mut entities = Vec::new();
    for snapshot in feed_state.all_snapshots().await {
        let relevant = relevant_entities(&snapshot, &state.filter);
        state
            .last_seq
            .insert(snapshot.source_id.clone(), snapshot.sequence);
        state.delivered.insert(
            snapshot.source_id.clone(),
            DeliveredState::from_entities(&relevant),
        );
        entities.extend(relevant);
    }

    let resync = state.needs_resync;
    state.needs_resync = false;
    state.degraded = false;

    OutboundMessage::Snapshot { entities, resync }
}

/// Registry and delivery engine for all active subscriptions.
pub struct FanoutHub {
    subscribers: RwLock<HashMap<Uuid, Arc<SubscriberShared>>>,
    feed_state: SharedFeedState,
    config: FanoutConfig,
}

impl FanoutHub {
    pub fn new(feed_state: SharedFeedState, config: FanoutConfig) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            feed_state,
            config,
        }
    }

    /// Register a subscription and hand back its receiver.
    ///
    /// The receiver's first message is a full snapshot of the current state
    /// matching the filter; incremental deltas follow.
    pub async fn subscribe(&self, filter: SubscriptionFilter) -> (Uuid, SubscriberReceiver) {
        let subscriber_id = Uuid::new_v4();

        let mut state = SubscriberState {
            filter,
            connection: ConnectionState::Connecting,
            queue: VecDeque::new(),
            needs_resync: false,
            degraded: false,
            delivered: HashMap::new(),
            last_seq: HashMap::new(),
            pending: HashMap::new(),
        };

        let initial = rebuild_from_current_state(&mut state, &self.feed_state).await;
        state.queue.push_back(initial);
        state.connection = ConnectionState::Active;

        let shared = Arc::new(SubscriberShared {
            state: Mutex::new(state),
            notify: Notify::new(),
        });
        shared.notify.notify_one();

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(subscriber_id, shared.clone());
        info!(subscriber = %subscriber_id, total = subscribers.len(), "Subscriber registered");

        let receiver = SubscriberReceiver {
            subscriber_id,
            shared,
            feed_state: self.feed_state.clone(),
        };
        (subscriber_id, receiver)
    }

    /// Drop a subscription and cancel its undelivered messages.
    pub async fn unsubscribe(&self, subscriber_id: Uuid) {
        let removed = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.remove(&subscriber_id)
        };

        if let Some(shared) = removed {
            let mut state = shared.state.lock().await;
            state.connection = ConnectionState::Draining;
            state.queue.clear();
            state.pending.clear();
            state.needs_resync = false;
            shared.notify.notify_one();
            info!(subscriber = %subscriber_id, "Subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Replace a subscription's filter in place.
    ///
    /// The subscriber's next receive is a full snapshot for the new filter;
    /// delivery state for the old filter is discarded with it.
    pub async fn update_filter(&self, subscriber_id: Uuid, filter: SubscriptionFilter) {
        let subscribers = self.subscribers.read().await;
        if let Some(shared) = subscribers.get(&subscriber_id) {
            let mut state = shared.state.lock().await;
            state.filter = filter;
            state.needs_resync = true;
            shared.notify.notify_one();
        }
    }

    /// Classify a freshly accepted snapshot against every subscription and
    /// enqueue the per-subscriber deltas.
    pub async fn publish_snapshot(&self, snapshot: &Arc<FeedSnapshot>) {
        let subscribers = self.subscribers.read().await;
        let mut delivered_to = 0usize;

        for (subscriber_id, shared) in subscribers.iter() {
            let mut state = shared.state.lock().await;
            if state.connection != ConnectionState::Active || state.needs_resync {
                continue;
            }

            let empty = DeliveredState::default();
            let delivered = state
                .delivered
                .get(&snapshot.source_id)
                .unwrap_or(&empty);
            let delta = relevant_delta(snapshot, &state.filter, delivered);

            if !delta.is_empty() {
                delivered_to += 1;
            }
            self.offer_delta(*subscriber_id, shared, &mut state, delta);
        }

        if delivered_to > 0 {
            debug!(
                source = %snapshot.source_id,
                sequence = snapshot.sequence,
                subscribers = delivered_to,
                "Published snapshot delta"
            );
        }
    }

    /// Deliver an already-classified delta to specific subscribers.
    pub async fn publish(&self, delta: &EntityDelta, targets: &[Uuid]) {
        let subscribers = self.subscribers.read().await;

        for subscriber_id in targets {
            let Some(shared) = subscribers.get(subscriber_id) else {
                continue;
            };
            let mut state = shared.state.lock().await;
            if state.connection != ConnectionState::Active || state.needs_resync {
                continue;
            }
            self.offer_delta(*subscriber_id, shared, &mut state, delta.clone());
        }
    }

    /// Apply ordering rules and enqueue. Caller holds the subscriber lock.
    fn offer_delta(
        &self,
        subscriber_id: Uuid,
        shared: &SubscriberShared,
        state: &mut SubscriberState,
        delta: EntityDelta,
    ) {
        let source_id = delta.source_id.clone();
        let last = state.last_seq.get(&source_id).copied().unwrap_or(0);

        if delta.sequence <= last {
            // Duplicate or stale; already reflected in delivered state
            return;
        }

        // last == 0 means no baseline for this source yet; adopt the stream
        // at whatever sequence it is at.
        if delta.sequence == last + 1 || last == 0 {
            self.apply_and_enqueue(shared, state, delta);

            // Drain any buffered successors that are now in order
            loop {
                let next_seq = state.last_seq.get(&source_id).copied().unwrap_or(0) + 1;
                let Some(buffer) = state.pending.get_mut(&source_id) else {
                    break;
                };
                let Some(next) = buffer.remove(&next_seq) else {
                    break;
                };
                self.apply_and_enqueue(shared, state, next);
            }
            return;
        }

        if delta.sequence - last > self.config.reorder_window {
            warn!(
                subscriber = %subscriber_id,
                source = %source_id,
                expected = last + 1,
                got = delta.sequence,
                "Sequence gap exceeds reorder window, forcing resync"
            );
            state.needs_resync = true;
            shared.notify.notify_one();
            return;
        }

        state
            .pending
            .entry(source_id)
            .or_default()
            .insert(delta.sequence, delta);
    }

    fn apply_and_enqueue(
        &self,
        shared: &SubscriberShared,
        state: &mut SubscriberState,
        delta: EntityDelta,
    ) {
        state.last_seq.insert(delta.source_id.clone(), delta.sequence);
        apply_delta(
            state.delivered.entry(delta.source_id.clone()).or_default(),
            &delta,
        );

        if delta.is_empty() {
            // Sequence advanced, nothing to tell the subscriber
            return;
        }

        if state.queue.len() >= self.config.queue_capacity {
            state.queue.pop_front();
            state.degraded = true;
            state.needs_resync = true;
            warn!("Subscriber queue full, dropping oldest message and scheduling resync");
        }
        state.queue.push_back(OutboundMessage::Delta(delta));
        shared.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::state::FeedStateStore;
    use crate::feed::types::{EntityPayload, FeedKind};
    use chrono::Utc;

    fn entity(id: &str, stop: &str, delay: i32, sequence: u64) -> FeedEntity {
        FeedEntity {
            entity_id: id.to_string(),
            trip_id: Some(format!("trip_{id}")),
            route_ids: Default::default(),
            stop_ids: [stop.to_string()].into_iter().collect(),
            payload: EntityPayload::TripUpdate {
                delay_seconds: Some(delay),
                stop_delays: vec![],
            },
            source_sequence: sequence,
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

    fn stop_filter(stop: &str) -> SubscriptionFilter {
        SubscriptionFilter {
            stop_ids: [stop.to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    async fn hub_with_state() -> (Arc<FanoutHub>, SharedFeedState) {
        let feed_state = Arc::new(FeedStateStore::new());
        feed_state.register_source("src").await;
        let hub = Arc::new(FanoutHub::new(feed_state.clone(), FanoutConfig::default()));
        (hub, feed_state)
    }

    async fn accept_and_publish(
        hub: &FanoutHub,
        feed_state: &SharedFeedState,
        snap: FeedSnapshot,
    ) {
        let accepted = feed_state.accept(snap).await.expect("snapshot accepted");
        hub.publish_snapshot(&accepted).await;
    }

    #[tokio::test]
    async fn test_subscribe_receives_initial_snapshot() {
        let (hub, feed_state) = hub_with_state().await;
        feed_state
            .accept(snapshot(3, vec![entity("a", "STOP_1", 0, 3)]))
            .await;

        let (_, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        match rx.recv().await.unwrap() {
            OutboundMessage::Snapshot { entities, resync } => {
                assert!(!resync);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, "a");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deltas_follow_initial_snapshot_in_order() {
        let (hub, feed_state) = hub_with_state().await;
        accept_and_publish(&hub, &feed_state, snapshot(1, vec![entity("a", "STOP_1", 0, 1)]))
            .await;

        let (_, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        rx.recv().await.unwrap(); // initial snapshot at sequence 1

        accept_and_publish(
            &hub,
            &feed_state,
            snapshot(2, vec![entity("a", "STOP_1", 60, 2)]),
        )
        .await;
        accept_and_publish(
            &hub,
            &feed_state,
            snapshot(3, vec![entity("a", "STOP_1", 120, 3)]),
        )
        .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (OutboundMessage::Delta(d1), OutboundMessage::Delta(d2)) => {
                assert_eq!(d1.sequence, 2);
                assert_eq!(d2.sequence, 3);
                assert_eq!(d1.updated.len(), 1);
            }
            other => panic!("expected two deltas, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_irrelevant_snapshot_produces_no_message() {
        let (hub, feed_state) = hub_with_state().await;
        let (_, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        rx.recv().await.unwrap();

        accept_and_publish(
            &hub,
            &feed_state,
            snapshot(1, vec![entity("x", "STOP_9", 0, 1)]),
        )
        .await;
        accept_and_publish(
            &hub,
            &feed_state,
            snapshot(2, vec![entity("a", "STOP_1", 0, 2)]),
        )
        .await;

        // The sequence-1 snapshot was silently absorbed; the first visible
        // message is the sequence-2 delta.
        match rx.recv().await.unwrap() {
            OutboundMessage::Delta(delta) => assert_eq!(delta.sequence, 2),
            other => panic!("expected delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backpressure_drops_backlog_and_resyncs() {
        let feed_state: SharedFeedState = Arc::new(FeedStateStore::new());
        feed_state.register_source("src").await;
        let hub = FanoutHub::new(
            feed_state.clone(),
            FanoutConfig {
                queue_capacity: 4,
                reorder_window: 8,
            },
        );

        let (_, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        rx.recv().await.unwrap();

        // Paused consumer: publish capacity + 2 changing deltas
        for seq in 1..=6u64 {
            let accepted = feed_state
                .accept(snapshot(seq, vec![entity("a", "STOP_1", seq as i32, seq)]))
                .await
                .unwrap();
            hub.publish_snapshot(&accepted).await;
        }

        // The overflowed subscriber is resynced with the full current state
        // instead of replaying six individual deltas.
        match rx.recv().await.unwrap() {
            OutboundMessage::Snapshot { entities, resync } => {
                assert!(resync);
                assert_eq!(entities.len(), 1);
                match &entities[0].payload {
                    EntityPayload::TripUpdate { delay_seconds, .. } => {
                        assert_eq!(*delay_seconds, Some(6));
                    }
                    other => panic!("wrong payload: {:?}", other),
                }
            }
            other => panic!("expected resync snapshot, got {:?}", other),
        }

        // After the resync, new deltas flow incrementally again
        let accepted = feed_state
            .accept(snapshot(7, vec![entity("a", "STOP_1", 700, 7)]))
            .await
            .unwrap();
        hub.publish_snapshot(&accepted).await;
        match rx.recv().await.unwrap() {
            OutboundMessage::Delta(delta) => assert_eq!(delta.sequence, 7),
            other => panic!("expected delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_delta_is_buffered_until_gap_fills() {
        let (hub, feed_state) = hub_with_state().await;
        accept_and_publish(&hub, &feed_state, snapshot(1, vec![entity("a", "STOP_1", 0, 1)]))
            .await;
        let (id, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        rx.recv().await.unwrap();

        let delta3 = EntityDelta {
            source_id: "src".to_string(),
            feed_kind: FeedKind::TripUpdates,
            sequence: 3,
            added: vec![],
            updated: vec![entity("a", "STOP_1", 300, 3)],
            removed: vec![],
        };
        let delta2 = EntityDelta {
            sequence: 2,
            updated: vec![entity("a", "STOP_1", 200, 2)],
            ..delta3.clone()
        };

        // Sequence 3 arrives first and must wait for 2
        hub.publish(&delta3, &[id]).await;
        hub.publish(&delta2, &[id]).await;

        match rx.recv().await.unwrap() {
            OutboundMessage::Delta(d) => assert_eq!(d.sequence, 2),
            other => panic!("expected delta 2, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            OutboundMessage::Delta(d) => assert_eq!(d.sequence, 3),
            other => panic!("expected delta 3, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gap_beyond_reorder_window_forces_resync() {
        let feed_state: SharedFeedState = Arc::new(FeedStateStore::new());
        feed_state.register_source("src").await;
        let hub = FanoutHub::new(
            feed_state.clone(),
            FanoutConfig {
                queue_capacity: 32,
                reorder_window: 2,
            },
        );

        feed_state
            .accept(snapshot(1, vec![entity("a", "STOP_1", 0, 1)]))
            .await;
        let (id, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        rx.recv().await.unwrap();

        let far_ahead = EntityDelta {
            source_id: "src".to_string(),
            feed_kind: FeedKind::TripUpdates,
            sequence: 10,
            added: vec![],
            updated: vec![entity("a", "STOP_1", 999, 10)],
            removed: vec![],
        };
        hub.publish(&far_ahead, &[id]).await;

        match rx.recv().await.unwrap() {
            OutboundMessage::Snapshot { resync, .. } => assert!(resync),
            other => panic!("expected resync snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_filter_resyncs_with_new_scope() {
        let (hub, feed_state) = hub_with_state().await;
        feed_state
            .accept(snapshot(
                1,
                vec![
                    entity("a", "STOP_1", 0, 1),
                    entity("b", "STOP_2", 0, 1),
                ],
            ))
            .await;

        let (id, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        match rx.recv().await.unwrap() {
            OutboundMessage::Snapshot { entities, .. } => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, "a");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        hub.update_filter(id, stop_filter("STOP_2")).await;
        match rx.recv().await.unwrap() {
            OutboundMessage::Snapshot { entities, resync } => {
                assert!(resync);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, "b");
            }
            other => panic!("expected resync snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_cancels_pending_deliveries() {
        let (hub, feed_state) = hub_with_state().await;
        let (id, rx) = hub.subscribe(stop_filter("STOP_1")).await;
        rx.recv().await.unwrap();
        assert_eq!(hub.subscriber_count().await, 1);

        accept_and_publish(
            &hub,
            &feed_state,
            snapshot(1, vec![entity("a", "STOP_1", 0, 1)]),
        )
        .await;
        hub.unsubscribe(id).await;

        assert_eq!(hub.subscriber_count().await, 0);
        assert!(rx.recv().await.is_none());
    }
}
