//! Polling of upstream realtime feeds.
//!
//! One background task per configured source fetches the GTFS-RT protobuf
//! payload on a fixed interval, normalizes it, and hands the resulting
//! snapshot to the state store and the fanout hub. Sources are fully
//! independent: a stuck or failing source delays nobody but itself.
//!
//! Failure handling: a failed poll keeps the previous snapshot authoritative
//! and retries with bounded exponential backoff (capped at one poll
//! interval). After enough consecutive failures the source is marked
//! degraded and polled at a widened interval, indefinitely; feeds come back,
//! so the loop never gives up on a source.

pub mod error;
pub mod state;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prost::Message;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, FeedSourceConfig};
use crate::fanout::FanoutHub;

use error::FeedError;
use state::SharedFeedState;
use types::normalize_feed;

/// Maximum allowed protobuf response size (50 MB)
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;

/// Polls every configured realtime source and publishes snapshots.
pub struct FeedCollector {
    client: reqwest::Client,
    sources: Vec<FeedSourceConfig>,
    backoff: CollectorConfig,
    state: SharedFeedState,
    hub: Arc<FanoutHub>,
}

impl FeedCollector {
    pub fn new(
        sources: Vec<FeedSourceConfig>,
        backoff: CollectorConfig,
        state: SharedFeedState,
        hub: Arc<FanoutHub>,
    ) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("transit-hub/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            sources,
            backoff,
            state,
            hub,
        })
    }

    /// Spawn one polling loop per source and run until shutdown.
    pub async fn start(self: Arc<Self>) {
        info!(sources = self.sources.len(), "Starting feed collector");

        let mut handles = Vec::new();
        for source in self.sources.clone() {
            self.state.register_source(&source.source_id).await;
            let collector = self.clone();
            handles.push(tokio::spawn(async move {
                collector.run_source(source).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_source(&self, source: FeedSourceConfig) {
        let base_interval = Duration::from_secs(source.poll_interval_secs);
        let mut sequence = 0u64;
        let mut degraded = false;

        info!(
            source = %source.source_id,
            kind = source.kind.as_str(),
            interval_secs = source.poll_interval_secs,
            "Starting feed poll loop"
        );

        loop {
            match self.poll_once(&source, sequence + 1).await {
                Ok(()) => {
                    sequence += 1;
                    if degraded {
                        info!(source = %source.source_id, "Feed source recovered");
                        degraded = false;
                    }
                    self.state.record_success(&source.source_id).await;
                    tokio::time::sleep(base_interval).await;
                }
                Err(e) => {
                    let failures = self.state.record_failure(&source.source_id).await;
                    warn!(
                        source = %source.source_id,
                        error = %e,
                        failures,
                        "Feed poll failed, keeping previous snapshot"
                    );

                    let (now_degraded, wait) = self.failure_wait(failures, base_interval);
                    if now_degraded && !degraded {
                        degraded = true;
                        self.state.mark_degraded(&source.source_id).await;
                        warn!(
                            source = %source.source_id,
                            factor = self.backoff.degraded_interval_factor,
                            "Feed source degraded, widening poll interval"
                        );
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// After a failed poll: is the source degraded now, and how long to wait
    /// before the next attempt.
    ///
    /// Below the degradation threshold the wait grows exponentially from the
    /// configured initial backoff, capped at one poll interval. At or beyond
    /// the threshold the source is polled at the widened interval.
    fn failure_wait(&self, failures: u32, base_interval: Duration) -> (bool, Duration) {
        if failures >= self.backoff.degraded_after {
            return (
                true,
                base_interval * self.backoff.degraded_interval_factor,
            );
        }

        let exponent = failures.saturating_sub(1).min(16);
        let factor = (self.backoff.backoff_multiplier as u64).saturating_pow(exponent);
        let delay = Duration::from_secs(self.backoff.initial_backoff_secs.saturating_mul(factor));
        (false, delay.min(base_interval))
    }

    async fn poll_once(&self, source: &FeedSourceConfig, sequence: u64) -> Result<(), FeedError> {
        let feed = self.fetch_feed(source).await?;
        let fetched_at = Utc::now();

        let snapshot = normalize_feed(&source.source_id, source.kind, sequence, fetched_at, &feed);
        let entity_count = snapshot.entities.len();

        if let Some(accepted) = self.state.accept(snapshot).await {
            debug!(
                source = %source.source_id,
                sequence,
                entities = entity_count,
                "Accepted feed snapshot"
            );
            self.hub.publish_snapshot(&accepted).await;
        }

        Ok(())
    }

    /// Fetch and decode one GTFS-RT payload, with a per-request timeout so a
    /// stuck upstream cannot outlive its own poll cycle.
    async fn fetch_feed(
        &self,
        source: &FeedSourceConfig,
    ) -> Result<gtfs_realtime::FeedMessage, FeedError> {
        let mut request = self
            .client
            .get(&source.url)
            .timeout(Duration::from_secs(source.timeout_secs));
        for (name, value) in &source.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(FeedError::NetworkMessage(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await?;

        if bytes.len() > MAX_PROTOBUF_SIZE {
            return Err(FeedError::NetworkMessage(format!(
                "response too large: {} bytes (max {} bytes)",
                bytes.len(),
                MAX_PROTOBUF_SIZE
            )));
        }

        gtfs_realtime::FeedMessage::decode(bytes.as_ref()).map_err(FeedError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::feed::state::FeedStateStore;

    fn collector_with_backoff(backoff: CollectorConfig) -> FeedCollector {
        let state: SharedFeedState = Arc::new(FeedStateStore::new());
        let hub = Arc::new(FanoutHub::new(state.clone(), FanoutConfig::default()));
        FeedCollector::new(vec![], backoff, state, hub).unwrap()
    }

    #[test]
    fn test_failure_wait_backs_off_exponentially_until_degraded() {
        let collector = collector_with_backoff(CollectorConfig::default());
        let interval = Duration::from_secs(30);

        let (degraded, wait) = collector.failure_wait(1, interval);
        assert!(!degraded);
        assert_eq!(wait, Duration::from_secs(1));

        let (degraded, wait) = collector.failure_wait(2, interval);
        assert!(!degraded);
        assert_eq!(wait, Duration::from_secs(2));

        // Third consecutive failure flips the source to degraded and widens
        // the cadence to four poll intervals.
        let (degraded, wait) = collector.failure_wait(3, interval);
        assert!(degraded);
        assert_eq!(wait, Duration::from_secs(120));

        let (degraded, wait) = collector.failure_wait(10, interval);
        assert!(degraded);
        assert_eq!(wait, Duration::from_secs(120));
    }

    #[test]
    fn test_failure_wait_is_capped_at_one_poll_interval() {
        let collector = collector_with_backoff(CollectorConfig {
            initial_backoff_secs: 5,
            backoff_multiplier: 10,
            degraded_after: 10,
            degraded_interval_factor: 4,
        });
        let interval = Duration::from_secs(30);

        // 5s, then 50s capped to the 30s interval
        assert_eq!(collector.failure_wait(1, interval).1, Duration::from_secs(5));
        assert_eq!(collector.failure_wait(2, interval).1, interval);
        assert_eq!(collector.failure_wait(9, interval).1, interval);
    }

    #[test]
    fn test_failure_wait_does_not_overflow_on_long_outages() {
        let collector = collector_with_backoff(CollectorConfig {
            initial_backoff_secs: 1,
            backoff_multiplier: 2,
            degraded_after: 1000,
            degraded_interval_factor: 4,
        });
        let interval = Duration::from_secs(30);

        let (degraded, wait) = collector.failure_wait(500, interval);
        assert!(!degraded);
        assert_eq!(wait, interval);
    }
}
