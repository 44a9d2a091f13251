//! Warden configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl WardenConfig {
    /// Load config from the default path (~/.warden/config.toml), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| WardenError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the warden home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warden")
    }

    /// Environment overrides: `WARDEN_DB_PATH`, `WARDEN_MAX_RETRIES`.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("WARDEN_DB_PATH") {
            if !path.is_empty() {
                self.store.path = path;
            }
        }
        if let Ok(raw) = std::env::var("WARDEN_MAX_RETRIES") {
            match raw.parse::<u32>() {
                Ok(n) => {
                    self.retry.max_retries = n;
                    self.dead_letter.max_retries = n;
                }
                Err(_) => tracing::warn!("⚠️ Ignoring invalid WARDEN_MAX_RETRIES='{raw}'"),
            }
        }
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let r = &self.retry;
        if r.max_retries == 0 {
            return Err(WardenError::Config("retry.max_retries must be >= 1".into()));
        }
        if r.max_backoff_ms < r.backoff_ms {
            return Err(WardenError::Config(
                "retry.max_backoff_ms must be >= retry.backoff_ms".into(),
            ));
        }
        if !(0.0..1.0).contains(&r.jitter_ratio) {
            return Err(WardenError::Config(
                "retry.jitter_ratio must be in [0, 1)".into(),
            ));
        }

        let d = &self.dead_letter;
        if d.max_retries == 0 {
            return Err(WardenError::Config("dead_letter.max_retries must be >= 1".into()));
        }
        if d.max_retry_delay_ms < d.initial_retry_delay_ms {
            return Err(WardenError::Config(
                "dead_letter.max_retry_delay_ms must be >= dead_letter.initial_retry_delay_ms"
                    .into(),
            ));
        }
        if d.processing_interval_ms == 0 || d.batch_size == 0 {
            return Err(WardenError::Config(
                "dead_letter.processing_interval_ms and batch_size must be > 0".into(),
            ));
        }

        let h = &self.health;
        if h.health_check_interval_ms == 0 || h.metrics_interval_ms == 0 {
            return Err(WardenError::Config(
                "health intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// In-process retry (`with_retry`) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per `with_retry` call, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    /// Jitter bound as a fraction of the computed delay (±).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 { 3 }
fn default_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_jitter_ratio() -> f64 { 0.2 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Dead-letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Failed replays before an entry is marked `failed`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Poll cadence.
    #[serde(default = "default_processing_interval_ms")]
    pub processing_interval_ms: u64,
    /// Max entries replayed per poll pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// `retrying` entries untouched for this long are reset to `pending`.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

fn default_initial_retry_delay_ms() -> u64 { 60_000 }
fn default_max_retry_delay_ms() -> u64 { 3_600_000 }
fn default_processing_interval_ms() -> u64 { 30_000 }
fn default_batch_size() -> usize { 50 }
fn default_stale_after_ms() -> u64 { 300_000 }

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            processing_interval_ms: default_processing_interval_ms(),
            batch_size: default_batch_size(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl DeadLetterConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Health check & metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    /// Error count at which an agent reports `unhealthy`.
    #[serde(default = "default_unhealthy_error_threshold")]
    pub unhealthy_error_threshold: u64,
    /// Error count at which an agent reports `degraded` (0 disables the band).
    #[serde(default = "default_degraded_error_threshold")]
    pub degraded_error_threshold: u64,
}

fn default_health_check_interval_ms() -> u64 { 60_000 }
fn default_metrics_interval_ms() -> u64 { 60_000 }
fn default_unhealthy_error_threshold() -> u64 { 10 }
fn default_degraded_error_threshold() -> u64 { 1 }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            unhealthy_error_threshold: default_unhealthy_error_threshold(),
            degraded_error_threshold: default_degraded_error_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (`~` is expanded by the binary).
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.warden/warden.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}
