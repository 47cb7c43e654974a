//! Read-through caching for schedule queries.
//!
//! `CacheProvider` is a plain keyed string cache with per-entry TTL; the
//! in-process implementation sits on moka. `CachedScheduleRepository`
//! decorates any `ScheduleRepository` with it: a hit never touches the
//! underlying store, a miss fetches and caches only successful results, and
//! concurrent misses for the same key coalesce into one underlying call.
//!
//! Cache trouble is never a query failure. A provider that cannot answer
//! behaves like a miss and the query falls through to the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DepartureQuery, DepartureRecord, ScheduleError, ScheduleRepository};

/// Keyed string cache with per-entry TTL.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn invalidate(&self, key: &str);
}

#[derive(Clone)]
struct CachedValue {
    payload: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache provider backed by moka.
pub struct MokaCacheProvider {
    cache: MokaCache<String, CachedValue>,
}

impl MokaCacheProvider {
    pub fn new(max_capacity: u64) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheProvider for MokaCacheProvider {
    async fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).await.map(|v| v.payload)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.cache
            .insert(
                key.to_string(),
                CachedValue {
                    payload: value,
                    ttl,
                },
            )
            .await;
    }

    async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }
}

/// Cache wrapper for any `ScheduleRepository`.
///
/// Keys are namespaced and include every query parameter plus a format
/// version tag, so a record-format change simply starts writing fresh keys
/// and the old ones expire unread.
pub struct CachedScheduleRepository {
    repo: Arc<dyn ScheduleRepository>,
    cache: Arc<dyn CacheProvider>,
    ttl: Duration,
    /// Per-key gates so concurrent misses share one underlying call.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CachedScheduleRepository {
    pub fn new(
        repo: Arc<dyn ScheduleRepository>,
        cache: Arc<dyn CacheProvider>,
        ttl: Duration,
    ) -> Self {
        Self {
            repo,
            cache,
            ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_key(query: &DepartureQuery) -> String {
        format!(
            "schedule:next_departures:feed={}:stop={}:date={}:time={}:limit={}:v1",
            query.feed_id,
            query.stop_id,
            query.service_date.format("%Y-%m-%d"),
            query.from_time.format("%H%M%S"),
            query.limit
        )
    }

    /// Read and decode a cached board. Undecodable content counts as a miss
    /// so a format change can never serve garbage.
    async fn read_cache(&self, key: &str) -> Option<Vec<DepartureRecord>> {
        let cached = self.cache.get(key).await?;
        match serde_json::from_str(&cached) {
            Ok(records) => Some(records),
            Err(e) => {
                debug!(key, error = %e, "Ignoring undecodable cache entry");
                None
            }
        }
    }
}

#[async_trait]
impl ScheduleRepository for CachedScheduleRepository {
    async fn next_departures(
        &self,
        query: &DepartureQuery,
    ) -> Result<Vec<DepartureRecord>, ScheduleError> {
        let key = Self::cache_key(query);

        if let Some(records) = self.read_cache(&key).await {
            return Ok(records);
        }

        // Single flight: first caller through takes the key's gate and does
        // the fetch; everyone else parks on the gate and re-reads the cache.
        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(key.clone()).or_default().clone()
        };
        let guard = gate.lock().await;

        if let Some(records) = self.read_cache(&key).await {
            return Ok(records);
        }

        let result = self.repo.next_departures(query).await;

        // Only successful results are cached; a failing store must be
        // retried by the next caller, not remembered.
        if let Ok(records) = &result {
            if let Ok(json) = serde_json::to_string(records) {
                self.cache.set(&key, json, self.ttl).await;
            }
        }

        drop(guard);
        self.in_flight.lock().await.remove(&key);

        result
    }
}
