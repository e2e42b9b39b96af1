//! Scheduler configuration.
//!
//! All options have defaults and can be set through `IMAGESERVER_*`
//! environment variables. Invalid values are coerced back to their defaults
//! with a warning rather than rejected, so a bad deployment knob degrades a
//! worker instead of killing it.

use std::time::Duration;

use log::warn;

/// Environment variable prefix for all options.
const ENV_PREFIX: &str = "IMAGESERVER_";

/// Configuration for a worker's scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether the scheduler throttles job starts by endpoint capacity.
    pub throttling_enabled: bool,

    /// Fraction of estimated endpoint capacity the scheduler may fill.
    /// Values above 1.0 deliberately overcommit and are allowed.
    pub capacity_target_percentage: f64,

    /// Concurrency assumed per instance when an endpoint carries no
    /// `osml:instance-concurrency` tag.
    pub default_instance_concurrency: u32,

    /// Concurrency assumed for plain HTTP endpoints.
    pub default_http_endpoint_concurrency: u32,

    /// Concurrent tile workers a single worker instance runs per job.
    pub tile_workers_per_instance: u32,

    /// How long endpoint metadata (capacity, variants) stays fresh.
    pub metadata_cache_ttl: Duration,

    /// Maximum messages drained from the FIFO per tick.
    pub fifo_fetch_limit: u32,

    /// Region edge length in pixels.
    pub region_size: u32,

    /// How long a terminated job record is retained.
    pub record_ttl: chrono::Duration,

    /// Receives before a FIFO message is routed to the DLQ automatically.
    pub max_receive_count: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            throttling_enabled: true,
            capacity_target_percentage: 1.0,
            default_instance_concurrency: 2,
            default_http_endpoint_concurrency: 10,
            tile_workers_per_instance: 4,
            metadata_cache_ttl: Duration::from_secs(300),
            fifo_fetch_limit: 10,
            region_size: 10240,
            record_ttl: chrono::Duration::days(7),
            max_receive_count: 3,
        }
    }
}

impl SchedulerConfig {
    /// Read the configuration from `IMAGESERVER_*` environment variables,
    /// coercing invalid values to defaults with a warning.
    pub fn from_env() -> Self {
        let defaults = SchedulerConfig::default();

        SchedulerConfig {
            throttling_enabled: env_bool("SCHEDULER_THROTTLING_ENABLED", defaults.throttling_enabled),
            capacity_target_percentage: env_fraction(
                "CAPACITY_TARGET_PERCENTAGE",
                defaults.capacity_target_percentage,
            ),
            default_instance_concurrency: env_positive(
                "DEFAULT_INSTANCE_CONCURRENCY",
                defaults.default_instance_concurrency,
            ),
            default_http_endpoint_concurrency: env_positive(
                "DEFAULT_HTTP_ENDPOINT_CONCURRENCY",
                defaults.default_http_endpoint_concurrency,
            ),
            tile_workers_per_instance: env_positive(
                "TILE_WORKERS_PER_INSTANCE",
                defaults.tile_workers_per_instance,
            ),
            metadata_cache_ttl: Duration::from_secs(u64::from(env_positive(
                "METADATA_CACHE_TTL_SECONDS",
                300,
            ))),
            fifo_fetch_limit: env_positive("FIFO_FETCH_LIMIT", defaults.fifo_fetch_limit),
            region_size: env_positive("REGION_SIZE", defaults.region_size),
            record_ttl: chrono::Duration::days(i64::from(env_positive("RECORD_TTL_DAYS", 7))),
            max_receive_count: env_positive("MAX_RECEIVE_COUNT", defaults.max_receive_count),
        }
    }

    /// Target capacity for an endpoint: `floor(max_capacity * p)`.
    pub fn target_capacity(&self, max_capacity: u32) -> u32 {
        (f64::from(max_capacity) * self.capacity_target_percentage).floor() as u32
    }
}

fn env_raw(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_raw(name) {
        None => default,
        Some(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                warn!(
                    "Invalid value {:?} for {}{}; using default {}",
                    raw, ENV_PREFIX, name, default
                );
                default
            }
        },
    }
}

fn env_positive(name: &str, default: u32) -> u32 {
    match env_raw(name) {
        None => default,
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) if v >= 1 => v,
            _ => {
                warn!(
                    "Invalid value {:?} for {}{}; using default {}",
                    raw, ENV_PREFIX, name, default
                );
                default
            }
        },
    }
}

fn env_fraction(name: &str, default: f64) -> f64 {
    match env_raw(name) {
        None => default,
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v > 0.0 && v.is_finite() => v,
            _ => {
                warn!(
                    "Invalid value {:?} for {}{}; using default {}",
                    raw, ENV_PREFIX, name, default
                );
                default
            }
        },
    }
}
