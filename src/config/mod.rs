use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level pool configuration
///
/// All fields are immutable once the pool is constructed. Timeouts are
/// expressed in milliseconds so the struct round-trips cleanly through
/// YAML and environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections the pool may hold
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Floor the pool pre-populates to and restores after replacements
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// How long an `acquire` call waits for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle connections older than this are proactively destroyed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    /// Health monitor settings
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    90_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Base backoff delay; doubled per failure while the circuit is open
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the backoff exponent, bounding the maximum wait
    #[serde(default = "default_max_backoff_exponent")]
    pub max_backoff_exponent: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_backoff_exponent() -> u32 {
    6
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_delay_ms: default_base_delay_ms(),
            max_backoff_exponent: default_max_backoff_exponent(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Configuration for health monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between health check cycles
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Upper bound on validations running at once within a cycle
    #[serde(default = "default_max_concurrent_validations")]
    pub max_concurrent_validations: usize,

    /// Per-validation timeout; exceeding it counts as a failure
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,

    /// Consecutive validation failures before a connection is replaced
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Log each validation outcome, not just cycle summaries
    #[serde(default)]
    pub detailed_logging: bool,
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrent_validations() -> usize {
    5
}

fn default_validation_timeout_ms() -> u64 {
    5000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_concurrent_validations: default_max_concurrent_validations(),
            validation_timeout_ms: default_validation_timeout_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
            detailed_logging: false,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<PoolConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: PoolConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables (all optional, falling back to defaults):
/// - CONPOOL_MAX_CONNECTIONS / CONPOOL_MIN_CONNECTIONS
/// - CONPOOL_ACQUIRE_TIMEOUT_MS / CONPOOL_IDLE_TIMEOUT_MS
/// - CONPOOL_FAILURE_THRESHOLD / CONPOOL_RETRY_DELAY_MS
/// - CONPOOL_HEALTH_INTERVAL_MS / CONPOOL_VALIDATION_TIMEOUT_MS
/// - CONPOOL_UNHEALTHY_THRESHOLD / CONPOOL_MAX_CONCURRENT_VALIDATIONS
pub fn load_from_env() -> Result<PoolConfig> {
    // Pick up a .env file when present (don't fail if it doesn't exist)
    let _ = dotenvy::dotenv();

    let mut config = PoolConfig::default();

    if let Some(v) = env_parse("CONPOOL_MAX_CONNECTIONS")? {
        config.max_connections = v;
    }
    if let Some(v) = env_parse("CONPOOL_MIN_CONNECTIONS")? {
        config.min_connections = v;
    }
    if let Some(v) = env_parse("CONPOOL_ACQUIRE_TIMEOUT_MS")? {
        config.acquire_timeout_ms = v;
    }
    if let Some(v) = env_parse("CONPOOL_IDLE_TIMEOUT_MS")? {
        config.idle_timeout_ms = v;
    }
    if let Some(v) = env_parse("CONPOOL_FAILURE_THRESHOLD")? {
        config.breaker.failure_threshold = v;
    }
    if let Some(v) = env_parse("CONPOOL_RETRY_DELAY_MS")? {
        config.breaker.base_delay_ms = v;
    }
    if let Some(v) = env_parse("CONPOOL_HEALTH_INTERVAL_MS")? {
        config.health.interval_ms = v;
    }
    if let Some(v) = env_parse("CONPOOL_VALIDATION_TIMEOUT_MS")? {
        config.health.validation_timeout_ms = v;
    }
    if let Some(v) = env_parse("CONPOOL_UNHEALTHY_THRESHOLD")? {
        config.health.unhealthy_threshold = v;
    }
    if let Some(v) = env_parse("CONPOOL_MAX_CONCURRENT_VALIDATIONS")? {
        config.health.max_concurrent_validations = v;
    }

    if config.min_connections > config.max_connections {
        anyhow::bail!(
            "CONPOOL_MIN_CONNECTIONS ({}) exceeds CONPOOL_MAX_CONNECTIONS ({})",
            config.min_connections,
            config.max_connections
        );
    }

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .context(format!("Failed to parse {name}={raw}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
