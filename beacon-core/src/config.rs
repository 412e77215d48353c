//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`. Every section
//! is optional; a missing file yields a fully defaulted [`Config`].
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::error::{Error, Result};
use crate::taxonomy::{EventSchema, SchemaMode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Remote collector endpoint and credentials
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Persistent queue limits and batching
    #[serde(default)]
    pub queue: QueueConfig,

    /// Network send, retries and compression
    #[serde(default)]
    pub transport: TransportConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Duplicate suppression window
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Session rotation
    #[serde(default)]
    pub identity: IdentityConfig,

    /// PII redaction
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    /// Event schemas
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,

    /// Dead letter queue limits
    #[serde(default)]
    pub dlq: DlqConfig,

    /// Flush scheduling and lifecycle
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote collector configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorConfig {
    /// Collector base URL (e.g., `https://collector.example.com`)
    pub server_url: Option<String>,

    /// Sent as a bearer token when present
    pub api_key: Option<String>,

    /// Sent as `X-Collector-ID` when present
    pub collector_id: Option<String>,
}

impl CollectorConfig {
    /// Check if the collector endpoint is configured
    pub fn is_ready(&self) -> bool {
        self.server_url.is_some()
    }

    /// Full URL batches are posted to
    pub fn batch_url(&self) -> Option<String> {
        self.server_url
            .as_ref()
            .map(|url| format!("{}/v1/batch", url.trim_end_matches('/')))
    }
}

/// Persistent queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum persisted entries; the oldest pending entry is evicted beyond it
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Failed delivery outcomes before an entry is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Events per batch
    #[serde(default = "default_batch_max_events")]
    pub batch_max_events: usize,

    /// Serialized bytes per batch (before compression)
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            batch_max_events: default_batch_max_events(),
            batch_max_bytes: default_batch_max_bytes(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_batch_max_events() -> usize {
    50
}

fn default_batch_max_bytes() -> usize {
    512 * 1024
}

/// Transport configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Deadline for a single HTTP attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Retries within one send, after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on any retry delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Fraction of each delay that is randomized away (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// zstd level
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Payloads smaller than this are sent uncompressed
    #[serde(default = "default_compression_min_bytes")]
    pub compression_min_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
            compression_level: default_compression_level(),
            compression_min_bytes: default_compression_min_bytes(),
        }
    }
}

impl TransportConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_compression_level() -> i32 {
    3
}

fn default_compression_min_bytes() -> usize {
    256
}

/// Circuit breaker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    /// Consecutive failed flushes before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown after the first trip
    #[serde(default = "default_cooldown_base_ms")]
    pub cooldown_base_ms: u64,

    /// Cooldown never grows past this
    #[serde(default = "default_cooldown_max_ms")]
    pub cooldown_max_ms: u64,

    /// Growth factor per consecutive trip
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_base_ms: default_cooldown_base_ms(),
            cooldown_max_ms: default_cooldown_max_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_base_ms() -> u64 {
    30_000
}

fn default_cooldown_max_ms() -> u64 {
    15 * 60 * 1000
}

fn default_cooldown_multiplier() -> f64 {
    2.0
}

/// Deduplication configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// How long an identical event is suppressed
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,

    /// Fingerprints remembered at once
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    /// Timestamp truncation folded into the fingerprint
    #[serde(default = "default_dedup_bucket_secs")]
    pub bucket_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window_secs(),
            capacity: default_dedup_capacity(),
            bucket_secs: default_dedup_bucket_secs(),
        }
    }
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_dedup_capacity() -> usize {
    1024
}

fn default_dedup_bucket_secs() -> u64 {
    3600
}

/// Identity configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Minutes without `track()` before the next call starts a new session
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            session_idle_minutes: default_session_idle_minutes(),
        }
    }
}

fn default_session_idle_minutes() -> u32 {
    30
}

/// Sanitizer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SanitizerConfig {
    /// Extra key patterns (regex, case-insensitive) whose values are always redacted
    #[serde(default)]
    pub deny_keys: Vec<String>,

    /// Extra value patterns (regex) redacted inside string values
    #[serde(default)]
    pub value_patterns: Vec<String>,

    /// Longer string values are truncated
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            deny_keys: vec![],
            value_patterns: vec![],
            max_string_len: default_max_string_len(),
        }
    }
}

fn default_max_string_len() -> usize {
    1024
}

/// Taxonomy configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TaxonomyConfig {
    /// Strict rejects unregistered names; permissive flags them
    #[serde(default)]
    pub mode: SchemaMode,

    /// Schemas registered at initialize, keyed by event name
    #[serde(default)]
    pub events: BTreeMap<String, EventSchema>,
}

/// Dead letter queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DlqConfig {
    /// Maximum dead letters kept; oldest are evicted first
    #[serde(default = "default_dlq_capacity")]
    pub capacity: usize,

    /// Dead letters older than this can no longer be replayed
    #[serde(default = "default_replay_window_hours")]
    pub replay_window_hours: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            capacity: default_dlq_capacity(),
            replay_window_hours: default_replay_window_hours(),
        }
    }
}

fn default_dlq_capacity() -> usize {
    1000
}

fn default_replay_window_hours() -> u32 {
    72
}

/// Scheduler and lifecycle configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Periodic flush interval
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Batches sent per cycle while they keep succeeding
    #[serde(default = "default_max_batches_per_cycle")]
    pub max_batches_per_cycle: usize,

    /// Upper bound on `shutdown()`
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Events buffered in memory while `initialize()` has not finished
    #[serde(default = "default_pre_init_capacity")]
    pub pre_init_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            max_batches_per_cycle: default_max_batches_per_cycle(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            pre_init_capacity: default_pre_init_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_max_batches_per_cycle() -> usize {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_pre_init_capacity() -> usize {
    1000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate numeric limits, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(Error::Config("queue.capacity must be at least 1".to_string()));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue.batch_max_events == 0 || self.queue.batch_max_bytes == 0 {
            return Err(Error::Config(
                "queue.batch_max_events and queue.batch_max_bytes must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.transport.jitter) {
            return Err(Error::Config(
                "transport.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.transport.backoff_max_ms < self.transport.backoff_base_ms {
            return Err(Error::Config(
                "transport.backoff_max_ms must not be below transport.backoff_base_ms"
                    .to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !self.breaker.cooldown_multiplier.is_finite() || self.breaker.cooldown_multiplier < 1.0
        {
            return Err(Error::Config(
                "breaker.cooldown_multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.breaker.cooldown_max_ms < self.breaker.cooldown_base_ms {
            return Err(Error::Config(
                "breaker.cooldown_max_ms must not be below breaker.cooldown_base_ms".to_string(),
            ));
        }
        if self.dedup.capacity == 0 {
            return Err(Error::Config("dedup.capacity must be at least 1".to_string()));
        }
        if self.dlq.capacity == 0 {
            return Err(Error::Config("dlq.capacity must be at least 1".to_string()));
        }
        if self.scheduler.flush_interval_secs == 0 {
            return Err(Error::Config(
                "scheduler.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite store)
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/beacon/queue.db` (~/.local/share/beacon/queue.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/beacon/beacon.log` (~/.local/state/beacon/beacon.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("beacon.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
