//! Service configuration.
//!
//! Every section has working defaults. [`AppConfig::from_env_or_default`]
//! applies `VOXRELAY_*` overrides on top of them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

use crate::domain::{PoolKey, Stage, Tier};
use crate::{Error, Result};

pub use crate::pipeline::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued stage requests per pool.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Ceiling on how long the oldest queued item waits for a batch to fill.
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_wait_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// A worker still running a batch after this long is retired.
    pub batch_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            batch_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
    /// Grow when queue depth is above this...
    pub high_water: usize,
    /// ...for this many consecutive samples.
    pub grow_after_samples: u32,
    pub low_water: usize,
    pub shrink_after_samples: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 1_000,
            high_water: 16,
            grow_after_samples: 3,
            low_water: 2,
            shrink_after_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bind_address: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub max_frame_len: usize,
    /// Outbound frames buffered per connection before the writer applies backpressure.
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7450,
            request_timeout_ms: 30_000,
            max_frame_len: relay_envelope::DEFAULT_MAX_FRAME_LEN,
            outbound_buffer: 256,
        }
    }
}

impl TransportConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_tier: Tier,
    pub max_text_chars: usize,
    /// Snapshots of finished jobs kept for status queries.
    pub finished_job_cache: usize,
    /// How long a synchronous translate request waits for its job.
    pub sync_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_tier: Tier::default(),
            max_text_chars: 10_000,
            finished_job_cache: 1_024,
            sync_timeout_ms: 25_000,
            event_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub dead_letter_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: 10,
            retry: RetryPolicy {
                max_attempts: 5,
                initial_delay_ms: 1_000,
                max_delay_ms: 60_000,
            },
            dead_letter_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite url. Pipeline records stay in memory when unset.
    pub url: Option<String>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 4,
            busy_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive. Falls back to `RUST_LOG`, then the built-in default.
    pub filter: Option<String>,
    /// Enables the daily-rolling file layer.
    pub log_dir: Option<String>,
}

/// Overrides for one (stage, tier) pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub stage: Stage,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Resolved settings for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub key: PoolKey,
    pub pool: PoolConfig,
    pub batch: BatchConfig,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub pool: PoolConfig,
    pub scaling: ScalingConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryPolicy,
    pub delivery: DeliveryConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingSettings,
    pub pools: Vec<PoolSpec>,
}

impl AppConfig {
    /// Load `.env`, then apply `VOXRELAY_*` variables over the defaults.
    pub fn from_env_or_default() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Malformed values are skipped.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("VOXRELAY_BIND_ADDRESS")
            && !addr.trim().is_empty()
        {
            config.transport.bind_address = addr;
        }
        if let Some(port) = parse_var(&lookup, "VOXRELAY_PORT") {
            config.transport.port = port;
        }
        if let Some(ms) = parse_var(&lookup, "VOXRELAY_REQUEST_TIMEOUT_MS") {
            config.transport.request_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "VOXRELAY_SYNC_TIMEOUT_MS") {
            config.orchestrator.sync_timeout_ms = ms;
        }
        if let Some(capacity) = parse_var(&lookup, "VOXRELAY_QUEUE_CAPACITY") {
            config.queue.capacity = capacity;
        }
        if let Some(size) = parse_var(&lookup, "VOXRELAY_MAX_BATCH_SIZE") {
            config.batch.max_batch_size = size;
        }
        if let Some(ms) = parse_var(&lookup, "VOXRELAY_MAX_WAIT_MS") {
            config.batch.max_wait_ms = ms;
        }
        if let Some(n) = parse_var(&lookup, "VOXRELAY_MIN_WORKERS") {
            config.pool.min_workers = n;
        }
        if let Some(n) = parse_var(&lookup, "VOXRELAY_MAX_WORKERS") {
            config.pool.max_workers = n;
        }
        if let Some(ms) = parse_var(&lookup, "VOXRELAY_BATCH_TIMEOUT_MS") {
            config.pool.batch_timeout_ms = ms;
        }
        if let Some(enabled) = parse_var(&lookup, "VOXRELAY_AUTOSCALE") {
            config.scaling.enabled = enabled;
        }
        if let Some(attempts) = parse_var(&lookup, "VOXRELAY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }
        if let Some(tier) = lookup("VOXRELAY_DEFAULT_TIER")
            && !tier.trim().is_empty()
        {
            config.orchestrator.default_tier = Tier::new(tier.trim());
        }
        if let Some(url) = lookup("VOXRELAY_WEBHOOK_URL")
            && !url.trim().is_empty()
        {
            config.delivery.webhook_url = Some(url);
        }
        if let Some(url) = lookup("VOXRELAY_DATABASE_URL")
            && !url.trim().is_empty()
        {
            config.database.url = Some(url);
        }
        if let Some(filter) = lookup("VOXRELAY_LOG_FILTER")
            && !filter.trim().is_empty()
        {
            config.logging.filter = Some(filter);
        }
        if let Some(dir) = lookup("VOXRELAY_LOG_DIR")
            && !dir.trim().is_empty()
        {
            config.logging.log_dir = Some(dir);
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        validate_pool("default", &self.pool, &self.batch)?;
        for spec in &self.pools {
            if !spec.stage.uses_model() {
                return Err(Error::config(format!(
                    "stage {} has no model pool",
                    spec.stage
                )));
            }
            validate_pool(
                &PoolKey::new(spec.stage, spec.tier.clone()).to_string(),
                &spec.pool,
                &spec.batch,
            )?;
        }
        if self.queue.capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        if self.retry.max_attempts == 0 || self.delivery.retry.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.scaling.enabled && self.scaling.low_water >= self.scaling.high_water {
            return Err(Error::config(format!(
                "scaling low_water ({}) must be below high_water ({})",
                self.scaling.low_water, self.scaling.high_water
            )));
        }
        if self.scaling.sample_interval_ms == 0 {
            return Err(Error::config("scaling sample interval must be non-zero"));
        }
        if self.orchestrator.sync_timeout_ms >= self.transport.request_timeout_ms {
            return Err(Error::config(format!(
                "sync timeout ({}ms) must be below the transport request timeout ({}ms)",
                self.orchestrator.sync_timeout_ms, self.transport.request_timeout_ms
            )));
        }
        Ok(())
    }

    /// Settings for every pool: one per model stage on the default tier,
    /// replaced or extended by `pools`.
    pub fn pool_settings(&self) -> Vec<PoolSettings> {
        let mut settings: BTreeMap<PoolKey, PoolSettings> = Stage::MODEL_STAGES
            .iter()
            .map(|stage| {
                let key = PoolKey::new(*stage, self.orchestrator.default_tier.clone());
                (
                    key.clone(),
                    PoolSettings {
                        key,
                        pool: self.pool.clone(),
                        batch: self.batch.clone(),
                        queue_capacity: self.queue.capacity,
                    },
                )
            })
            .collect();

        for spec in &self.pools {
            let key = PoolKey::new(spec.stage, spec.tier.clone());
            settings.insert(
                key.clone(),
                PoolSettings {
                    key,
                    pool: spec.pool.clone(),
                    batch: spec.batch.clone(),
                    queue_capacity: self.queue.capacity,
                },
            );
        }

        settings.into_values().collect()
    }
}

fn validate_pool(name: &str, pool: &PoolConfig, batch: &BatchConfig) -> Result<()> {
    if pool.max_workers == 0 {
        return Err(Error::config(format!("pool {}: max_workers must be at least 1", name)));
    }
    if pool.min_workers > pool.max_workers {
        return Err(Error::config(format!(
            "pool {}: min_workers ({}) exceeds max_workers ({})",
            name, pool.min_workers, pool.max_workers
        )));
    }
    if batch.max_batch_size == 0 {
        return Err(Error::config(format!("pool {}: max_batch_size must be at least 1", name)));
    }
    if pool.batch_timeout_ms == 0 {
        return Err(Error::config(format!("pool {}: batch_timeout_ms must be non-zero", name)));
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring malformed environment value");
            None
        }
    }
}
