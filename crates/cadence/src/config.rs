use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CONFIG_PATH_ENV_VAR: &str = "CADENCE_CONFIG";
pub const TICK_HZ_ENV_VAR: &str = "CADENCE_TICK_HZ";
pub const MAX_PRESENT_HZ_ENV_VAR: &str = "CADENCE_MAX_PRESENT_HZ";

const DEFAULT_TICK_HZ: f64 = 60.0;
const DEFAULT_MAX_PRESENT_HZ: f64 = 144.0;
const DEFAULT_METRICS_LOG_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_IDLE_SLEEP_MS: u64 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a finite frequency above zero, got {value}")]
    InvalidFrequency { field: &'static str, value: f64 },
    #[error("{field} of {value} Hz is too high to derive a non-zero interval")]
    FrequencyTooHigh { field: &'static str, value: f64 },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config json at {field_path}: {source}")]
    Parse {
        field_path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CadenceConfig {
    pub tick_hz: f64,
    pub max_present_hz: f64,
    pub metrics_log_interval_ms: u64,
    pub max_idle_sleep_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            tick_hz: DEFAULT_TICK_HZ,
            max_present_hz: DEFAULT_MAX_PRESENT_HZ,
            metrics_log_interval_ms: DEFAULT_METRICS_LOG_INTERVAL_MS,
            max_idle_sleep_ms: DEFAULT_MAX_IDLE_SLEEP_MS,
        }
    }
}

impl CadenceConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        let config: Self = match serde_path_to_error::deserialize(&mut deserializer) {
            Ok(config) => config,
            Err(error) => {
                let field_path = error.path().to_string();
                return Err(ConfigError::Parse {
                    field_path: if field_path.is_empty() {
                        ".".to_string()
                    } else {
                        field_path
                    },
                    source: error.into_inner(),
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw).map_err(|source| ConfigError::File {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        interval_for_hz("tick_hz", self.tick_hz)?;
        interval_for_hz("max_present_hz", self.max_present_hz)?;
        Ok(())
    }

    /// Applies `CADENCE_TICK_HZ` and `CADENCE_MAX_PRESENT_HZ` when set.
    pub fn with_env_overrides(mut self) -> Self {
        self.tick_hz =
            resolve_hz_override(TICK_HZ_ENV_VAR, self.tick_hz, env::var(TICK_HZ_ENV_VAR));
        self.max_present_hz = resolve_hz_override(
            MAX_PRESENT_HZ_ENV_VAR,
            self.max_present_hz,
            env::var(MAX_PRESENT_HZ_ENV_VAR),
        );
        self
    }

    pub fn metrics_log_interval(&self) -> Duration {
        normalize_non_zero_duration(
            Duration::from_millis(self.metrics_log_interval_ms),
            Duration::from_millis(DEFAULT_METRICS_LOG_INTERVAL_MS),
        )
    }

    pub fn max_idle_sleep(&self) -> Duration {
        normalize_non_zero_duration(
            Duration::from_millis(self.max_idle_sleep_ms),
            Duration::from_millis(DEFAULT_MAX_IDLE_SLEEP_MS),
        )
    }
}

/// Nominal period for a frequency, rejecting values that cannot pace anything.
pub fn interval_for_hz(field: &'static str, hz: f64) -> Result<Duration, ConfigError> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(ConfigError::InvalidFrequency { field, value: hz });
    }
    let interval = Duration::from_secs_f64(1.0 / hz);
    if interval.is_zero() {
        return Err(ConfigError::FrequencyTooHigh { field, value: hz });
    }
    Ok(interval)
}

pub(crate) fn normalize_non_zero_duration(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}

fn resolve_hz_override(
    env_var: &'static str,
    configured: f64,
    raw: Result<String, env::VarError>,
) -> f64 {
    match raw {
        Ok(value) => match value.trim().parse::<f64>() {
            Ok(hz) if interval_for_hz(env_var, hz).is_ok() => hz,
            _ => {
                warn!(
                    env_var,
                    value = value.as_str(),
                    "invalid frequency env var value; falling back to config"
                );
                configured
            }
        },
        Err(env::VarError::NotPresent) => configured,
        Err(err) => {
            warn!(
                env_var,
                error = %err,
                "unable to read frequency env var; falling back to config"
            );
            configured
        }
    }
}
