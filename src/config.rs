use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::feed::types::FeedKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream realtime feed sources to poll.
    pub feeds: Vec<FeedSourceConfig>,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Schedule store backend selection and settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Read-through cache settings for schedule queries.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Departure query parameter bounds.
    #[serde(default)]
    pub query: QueryConfig,
    /// Subscriber delivery bounds.
    #[serde(default)]
    pub fanout: FanoutConfig,
    /// Feed polling retry/degradation behavior.
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Display screens that clients may subscribe to by id.
    #[serde(default)]
    pub screens: Vec<ScreenConfig>,
}

/// One upstream realtime feed source (GTFS-RT protobuf over HTTP).
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSourceConfig {
    /// Stable identifier for this source, used in snapshots and delivery state.
    pub source_id: String,
    pub url: String,
    pub kind: FeedKind,
    /// Operating agency, informational only.
    #[serde(default)]
    pub agency: Option<String>,
    /// Seconds between polls (default: 30)
    #[serde(default = "FeedSourceConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Per-request timeout in seconds (default: 10). Must be shorter than the
    /// poll interval so a stuck request cannot overlap the next cycle.
    #[serde(default = "FeedSourceConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra request headers, e.g. an API key header required by the provider.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl FeedSourceConfig {
    fn default_poll_interval_secs() -> u64 {
        30
    }
    fn default_timeout_secs() -> u64 {
        10
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleBackend {
    Sqlite,
    Sparql,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Which schedule store implementation serves departure queries.
    #[serde(default = "ScheduleConfig::default_backend")]
    pub backend: ScheduleBackend,
    /// Path to the SQLite database file (sqlite backend).
    #[serde(default = "ScheduleConfig::default_database_path")]
    pub database_path: String,
    /// SPARQL endpoint URL (sparql backend).
    #[serde(default)]
    pub sparql_endpoint: Option<String>,
    /// Feed used when a query does not name one.
    #[serde(default)]
    pub default_feed_id: Option<String>,
    /// IANA timezone the schedule's service days are defined in (default: UTC)
    #[serde(default = "ScheduleConfig::default_timezone")]
    pub timezone: String,
}

impl ScheduleConfig {
    fn default_backend() -> ScheduleBackend {
        ScheduleBackend::Sqlite
    }
    fn default_database_path() -> String {
        "database/schedule.db".to_string()
    }
    fn default_timezone() -> String {
        "UTC".to_string()
    }

    pub fn parsed_timezone(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backend: Self::default_backend(),
            database_path: Self::default_database_path(),
            sparql_endpoint: None,
            default_feed_id: None,
            timezone: Self::default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Whether to wrap the schedule repository with the cache (default: true)
    #[serde(default = "CacheConfig::default_enabled")]
    pub enabled: bool,
    /// Seconds a cached departure board stays valid (default: 60)
    #[serde(default = "CacheConfig::default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Maximum number of cached boards (default: 10000)
    #[serde(default = "CacheConfig::default_max_capacity")]
    pub max_capacity: u64,
}

impl CacheConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_ttl_seconds() -> u64 {
        60
    }
    fn default_max_capacity() -> u64 {
        10_000
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            ttl_seconds: Self::default_ttl_seconds(),
            max_capacity: Self::default_max_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Results returned when a query does not specify a limit (default: 10)
    #[serde(default = "QueryConfig::default_default_limit")]
    pub default_limit: u32,
    /// Largest accepted result limit (default: 100)
    #[serde(default = "QueryConfig::default_max_limit")]
    pub max_limit: u32,
}

impl QueryConfig {
    fn default_default_limit() -> u32 {
        10
    }
    fn default_max_limit() -> u32 {
        100
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: Self::default_default_limit(),
            max_limit: Self::default_max_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Outbound messages buffered per subscriber before the oldest is dropped
    /// and the subscriber is resynced (default: 32)
    #[serde(default = "FanoutConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// How many sequence numbers ahead of the expected one a delta may arrive
    /// before the subscriber is resynced instead of waiting (default: 8)
    #[serde(default = "FanoutConfig::default_reorder_window")]
    pub reorder_window: u64,
}

impl FanoutConfig {
    fn default_queue_capacity() -> usize {
        32
    }
    fn default_reorder_window() -> u64 {
        8
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            reorder_window: Self::default_reorder_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// First retry delay after a failed poll, in seconds (default: 1)
    #[serde(default = "CollectorConfig::default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Backoff multiplier between consecutive failed polls (default: 2).
    /// The delay is always capped at one poll interval.
    #[serde(default = "CollectorConfig::default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Consecutive failures before a source is marked degraded (default: 3)
    #[serde(default = "CollectorConfig::default_degraded_after")]
    pub degraded_after: u32,
    /// Poll interval widening factor while a source is degraded (default: 4)
    #[serde(default = "CollectorConfig::default_degraded_interval_factor")]
    pub degraded_interval_factor: u32,
}

impl CollectorConfig {
    fn default_initial_backoff_secs() -> u64 {
        1
    }
    fn default_backoff_multiplier() -> u32 {
        2
    }
    fn default_degraded_after() -> u32 {
        3
    }
    fn default_degraded_interval_factor() -> u32 {
        4
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: Self::default_initial_backoff_secs(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            degraded_after: Self::default_degraded_after(),
            degraded_interval_factor: Self::default_degraded_interval_factor(),
        }
    }
}

/// A display screen: a named set of stops and routes that a connecting client
/// can subscribe to without listing them individually.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenConfig {
    pub screen_id: String,
    #[serde(default)]
    pub stop_ids: Vec<String>,
    #[serde(default)]
    pub route_ids: Vec<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Panics with a descriptive message on values the pipeline cannot run with.
    pub fn validate(&self) {
        let mut seen_sources = HashSet::new();
        for feed in &self.feeds {
            if feed.source_id.is_empty() {
                panic!("Feed config error: source_id must not be empty");
            }
            if !seen_sources.insert(feed.source_id.as_str()) {
                panic!(
                    "Feed config error: duplicate source_id '{}'",
                    feed.source_id
                );
            }
            if feed.url.is_empty() {
                panic!(
                    "Feed config error: source '{}' has an empty url",
                    feed.source_id
                );
            }
            if feed.poll_interval_secs == 0 {
                panic!(
                    "Feed config error: source '{}' poll_interval_secs must be > 0",
                    feed.source_id
                );
            }
            if feed.timeout_secs >= feed.poll_interval_secs {
                panic!(
                    "Feed config error: source '{}' timeout_secs ({}) must be shorter than poll_interval_secs ({})",
                    feed.source_id, feed.timeout_secs, feed.poll_interval_secs
                );
            }
        }

        if self.schedule.backend == ScheduleBackend::Sparql
            && self.schedule.sparql_endpoint.is_none()
        {
            panic!("Schedule config error: backend 'sparql' requires sparql_endpoint");
        }
        if self.schedule.timezone.parse::<chrono_tz::Tz>().is_err() {
            panic!(
                "Schedule config error: unknown timezone '{}'",
                self.schedule.timezone
            );
        }

        if self.query.default_limit == 0 || self.query.max_limit == 0 {
            panic!("Query config error: limits must be >= 1");
        }
        if self.query.default_limit > self.query.max_limit {
            panic!(
                "Query config error: default_limit ({}) exceeds max_limit ({})",
                self.query.default_limit, self.query.max_limit
            );
        }

        if self.fanout.queue_capacity == 0 {
            panic!("Fanout config error: queue_capacity must be >= 1");
        }
        if self.collector.degraded_after == 0 {
            panic!("Collector config error: degraded_after must be >= 1");
        }
        if self.collector.backoff_multiplier == 0 || self.collector.degraded_interval_factor == 0 {
            panic!("Collector config error: multipliers must be >= 1");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
