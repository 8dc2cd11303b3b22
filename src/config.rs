use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProcedureError, Result};

/// Procedure executor configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    // Worker pool configuration
    /// Maximum number of steps executing concurrently
    pub max_workers: usize,

    // Queue configuration
    /// Maximum number of unfinished procedures admitted at once
    pub queue_capacity: usize,

    // Retry configuration
    /// Transient failures tolerated per step before the procedure fails
    pub max_step_retries: u32,
    /// Initial retry delay
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Maximum retry delay
    #[serde(with = "millis")]
    pub max_retry_delay: Duration,
    /// Retry backoff multiplier
    pub retry_backoff_multiplier: f64,

    // Retention
    /// How long a nonce mapping is kept after it was recorded
    #[serde(with = "millis")]
    pub nonce_ttl: Duration,
    /// How long a finished procedure tree stays listed before eviction
    #[serde(with = "millis")]
    pub completed_procedure_ttl: Duration,
    /// Interval of the eviction and compaction chore
    #[serde(with = "millis")]
    pub cleaner_interval: Duration,

    // Storage configuration
    /// Directory of the on-disk procedure store; `None` keeps state in memory
    pub store_path: Option<PathBuf>,
    /// Flush the store after every append
    pub store_sync: bool,
    /// zstd level for persisted records
    pub compression_level: i32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            max_workers: cpu_count.max(2),
            queue_capacity: 10_000,

            max_step_retries: 5,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(60),
            retry_backoff_multiplier: 2.0,

            nonce_ttl: Duration::from_secs(15 * 60),
            completed_procedure_ttl: Duration::from_secs(15 * 60),
            cleaner_interval: Duration::from_secs(30),

            store_path: None,
            store_sync: true,
            compression_level: 3,
        }
    }
}

impl ExecutorConfig {
    /// Create a new builder for ExecutorConfig
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(invalid("max_workers must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(invalid("retry_backoff_multiplier must be >= 1.0"));
        }
        if self.retry_delay > self.max_retry_delay {
            return Err(invalid("retry_delay cannot exceed max_retry_delay"));
        }
        if self.cleaner_interval.is_zero() {
            return Err(invalid("cleaner_interval must be greater than 0"));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(invalid("compression_level must be within 1..=22"));
        }
        Ok(())
    }

    /// Create a configuration suited for tests: small pool, fast retries
    pub fn development() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 100,
            max_step_retries: 3,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(200),
            nonce_ttl: Duration::from_secs(60),
            completed_procedure_ttl: Duration::from_secs(60),
            cleaner_interval: Duration::from_secs(1),
            store_sync: false,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for production
    pub fn production() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            max_workers: cpu_count * 4,
            queue_capacity: 100_000,
            max_step_retries: 10,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(5 * 60),
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Backoff before retry number `attempt` (1-based), capped and jittered by up to 10%.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_backoff_multiplier
            .powi(attempt.saturating_sub(1).min(32) as i32);
        let base = self.retry_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_retry_delay.as_secs_f64());
        let jitter = capped * 0.1 * fastrand::f64();
        Duration::from_secs_f64(capped + jitter).min(self.max_retry_delay)
    }
}

fn invalid(msg: &str) -> ProcedureError {
    ProcedureError::InvalidConfiguration(msg.to_string())
}

/// Builder for ExecutorConfig
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl Default for ExecutorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
        }
    }

    pub fn from_config(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Set maximum workers
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    /// Set queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the number of transient retries per step
    pub fn max_step_retries(mut self, retries: u32) -> Self {
        self.config.max_step_retries = retries;
        self
    }

    /// Set retry delays
    pub fn retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry_delay = initial;
        self.config.max_retry_delay = max;
        self
    }

    pub fn retry_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn nonce_ttl(mut self, ttl: Duration) -> Self {
        self.config.nonce_ttl = ttl;
        self
    }

    pub fn completed_procedure_ttl(mut self, ttl: Duration) -> Self {
        self.config.completed_procedure_ttl = ttl;
        self
    }

    pub fn cleaner_interval(mut self, interval: Duration) -> Self {
        self.config.cleaner_interval = interval;
        self
    }

    /// Set the on-disk store directory
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self
    }

    pub fn store_sync(mut self, sync: bool) -> Self {
        self.config.store_sync = sync;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ExecutorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Durations as integer milliseconds, which reads better in YAML than `{secs, nanos}`.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
