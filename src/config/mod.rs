//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Environment variables override file values. Sensitive values are wrapped
//! in `secrecy::SecretString` so they never show up in `Debug` output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::strategy::{ClaimStrategy, DEFAULT_TOP_K, Weighting};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
}

/// Settings for one worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Defaults to `<hostname>-<random suffix>`.
    pub worker_id: String,
    /// First backoff interval after an empty poll.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    #[serde(with = "secs")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Transient failures allowed before a task is terminally failed.
    /// Tasks may override this individually.
    pub max_retries: u32,
    /// `fifo`, `lifo`, `priority` or `weighted_random`.
    pub claiming_strategy: String,
    pub weighted_top_k: u32,
    pub weighting: Weighting,
    /// Hard limit on one work function call. Exceeding it is a transient failure.
    #[serde(with = "secs_opt")]
    pub task_timeout: Option<Duration>,
    /// Heartbeat cadence while a task is executing.
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a worker is reported stale.
    #[serde(with = "secs")]
    pub stale_after: Duration,
    /// When set, claims held by workers silent for this long are returned
    /// to the queue. Off by default.
    #[serde(with = "secs_opt")]
    pub reclaim_stale_after: Option<Duration>,
    pub enable_registry_sync: bool,
    /// Only claim these task types. Empty means every registered type.
    pub task_types: Vec<String>,
    /// Directory of command task type definitions.
    pub task_types_dir: Option<PathBuf>,
    /// Where completed results are written, one JSON file per task.
    pub results_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 1.5,
            max_retries: 3,
            claiming_strategy: "fifo".to_string(),
            weighted_top_k: DEFAULT_TOP_K,
            weighting: Weighting::Linear,
            task_timeout: None,
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            reclaim_stale_after: None,
            enable_registry_sync: true,
            task_types: Vec::new(),
            task_types_dir: None,
            results_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Parse `claiming_strategy`, applying the weighted settings.
    pub fn strategy(&self) -> Result<ClaimStrategy> {
        Ok(match self.claiming_strategy.parse::<ClaimStrategy>()? {
            ClaimStrategy::WeightedRandom { .. } => ClaimStrategy::WeightedRandom {
                top_k: self.weighted_top_k,
                weighting: self.weighting,
            },
            other => other,
        })
    }

    /// Reject settings the worker loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(Error::Config("worker_id must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be positive".to_string()));
        }
        if self.max_backoff < self.poll_interval {
            return Err(Error::Config(
                "max_backoff must be at least poll_interval".to_string(),
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval must be positive".to_string()));
        }
        self.strategy()?;
        Ok(())
    }
}

/// External task registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL, e.g. `https://registry.internal/api`. Sync is off without it.
    pub url: Option<String>,
    #[serde(skip)]
    pub token: Option<SecretString>,
    #[serde(with = "secs_opt")]
    pub timeout: Option<Duration>,
}

/// On-disk layout of the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    database_url: Option<String>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
    worker: WorkerConfig,
    registry: RegistryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(FileConfig::default(), env_var)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))?;
        Self::from_lookup(file, env_var)
    }

    /// Same as [`Config::from_env`] but reads variables from a map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(FileConfig::default(), |name| vars.get(name).cloned())
    }

    /// Same as [`Config::from_file`] with TOML text and a variable map.
    pub fn from_toml_with_vars(content: &str, vars: &HashMap<String, String>) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        Self::from_lookup(file, |name| vars.get(name).cloned())
    }

    fn from_lookup(file: FileConfig, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let FileConfig {
            database_url,
            otel_endpoint,
            log_level,
            mut worker,
            mut registry,
        } = file;

        let database_url = var("DATABASE_URL").or(database_url).ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })?;

        if let Some(v) = var("WORKER_ID") {
            worker.worker_id = v;
        }
        if let Some(v) = secs_var(&var, "POLL_INTERVAL_SECS")? {
            worker.poll_interval = v;
        }
        if let Some(v) = secs_var(&var, "MAX_BACKOFF_SECS")? {
            worker.max_backoff = v;
        }
        if let Some(v) = parse_var(&var, "BACKOFF_MULTIPLIER")? {
            worker.backoff_multiplier = v;
        }
        if let Some(v) = parse_var(&var, "MAX_RETRIES")? {
            worker.max_retries = v;
        }
        if let Some(v) = var("CLAIMING_STRATEGY") {
            worker.claiming_strategy = v;
        }
        if let Some(v) = secs_var(&var, "TASK_TIMEOUT_SECS")? {
            worker.task_timeout = Some(v);
        }
        if let Some(v) = secs_var(&var, "RECLAIM_STALE_AFTER_SECS")? {
            worker.reclaim_stale_after = Some(v);
        }
        if let Some(v) = parse_var(&var, "ENABLE_REGISTRY_SYNC")? {
            worker.enable_registry_sync = v;
        }
        if let Some(v) = var("TASK_TYPES_DIR") {
            worker.task_types_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("REGISTRY_URL") {
            registry.url = Some(v);
        }
        registry.token = var("REGISTRY_TOKEN").map(SecretString::from);

        worker.validate()?;

        Ok(Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: var("OTEL_ENDPOINT").or(otel_endpoint),
            log_level: var("LOG_LEVEL")
                .or(log_level)
                .unwrap_or_else(|| "info".to_string()),
            worker,
            registry,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}

fn secs_var(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    parse_var::<f64>(var, name)?
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::Config(format!("invalid {name}={secs}: {e}")))
        })
        .transpose()
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix: u32 = rand::random();
    format!("{host}-{:06x}", suffix & 0xff_ffff)
}

/// Durations written as (fractional) seconds.
mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod secs_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
