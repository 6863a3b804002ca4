//! Server configuration.
//!
//! Layered with `figment`: built-in defaults, then an optional TOML file
//! (`--config <path>` or `BERTH_CONFIG`), then `BERTH_*` environment
//! variables. Nested keys use `__`, e.g. `BERTH_OUTBOX__BATCH_SIZE=50`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::model::{HOUR_MS, MINUTE_MS, Ms};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub arbiter: ArbiterConfig,
    pub outbox: OutboxConfig,
    pub reminders: ReminderConfig,
    pub rate_limit: RateLimitConfig,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub password: String,
    pub max_connections: usize,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("tls_cert", &self.tls_cert)
            .field("tls_key", &self.tls_key)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            password: "berth".into(),
            max_connections: 256,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Compact once this many events were appended since the last compaction.
    pub compact_threshold: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 10_000,
        }
    }
}

impl StorageConfig {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("berth.wal")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub lock_timeout_ms: u64,
    pub arbitration_retries: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            arbitration_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub lease_ms: Ms,
    pub delivery_timeout_ms: u64,
    pub initial_backoff_ms: Ms,
    pub max_backoff_ms: Ms,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 50,
            max_attempts: 8,
            lease_ms: 30_000,
            delivery_timeout_ms: 10_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 5 * MINUTE_MS,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    pub interval_ms: u64,
    /// How long before the start each reminder goes out.
    pub lead_times_ms: Vec<Ms>,
    /// Half-width of the match window around `now + lead`. Should cover at
    /// least one interval so no start time falls between two sweeps.
    pub tolerance_ms: Ms,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            lead_times_ms: vec![24 * HOUR_MS, HOUR_MS],
            tolerance_ms: 5 * MINUTE_MS,
        }
    }
}

impl ReminderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size per requester.
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_sec: 5.0,
        }
    }
}

impl Config {
    /// Load from defaults, an optional TOML file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("BERTH_CONFIG").map(PathBuf::from));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        figment = figment.merge(Env::prefixed("BERTH_").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be positive"));
        }
        if self.outbox.batch_size == 0 || self.outbox.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size and poll_interval_ms must be positive"));
        }
        if self.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid("outbox.max_attempts must be positive"));
        }
        // The delivery worker claims one entry per attempt; its lease must
        // outlast the attempt or another worker sends it again.
        if self.outbox.delivery_timeout_ms == 0 || self.outbox.lease_ms <= self.outbox.delivery_timeout_ms as Ms {
            return Err(ConfigError::Invalid(
                "outbox.lease_ms must exceed outbox.delivery_timeout_ms, which must be positive",
            ));
        }
        if self.outbox.initial_backoff_ms <= 0 || self.outbox.max_backoff_ms < self.outbox.initial_backoff_ms {
            return Err(ConfigError::Invalid("outbox backoff must satisfy 0 < initial <= max"));
        }
        if self.reminders.interval_ms == 0 || self.reminders.lead_times_ms.iter().any(|l| *l <= 0) {
            return Err(ConfigError::Invalid("reminder interval and lead times must be positive"));
        }
        if self.reminders.tolerance_ms < 0 {
            return Err(ConfigError::Invalid("reminders.tolerance_ms must not be negative"));
        }
        let refill = self.rate_limit.refill_per_sec;
        if self.rate_limit.capacity == 0 || refill.is_nan() || refill <= 0.0 {
            return Err(ConfigError::Invalid("rate_limit capacity and refill must be positive"));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lock_timeout: Duration::from_millis(self.arbiter.lock_timeout_ms),
            arbitration_retries: self.arbiter.arbitration_retries,
            outbox_max_attempts: self.outbox.max_attempts,
            outbox_lease_ms: self.outbox.lease_ms,
            initial_backoff_ms: self.outbox.initial_backoff_ms,
            max_backoff_ms: self.outbox.max_backoff_ms,
        }
    }
}
