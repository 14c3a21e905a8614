use std::env;
use std::path::Path;

use cadence::{CadenceConfig, ConfigError, CONFIG_PATH_ENV_VAR};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

/// Defaults, then the file named by `CADENCE_CONFIG`, then frequency env vars.
pub(crate) fn load_config() -> Result<CadenceConfig, ConfigError> {
    let config = resolve_base_config(env::var(CONFIG_PATH_ENV_VAR))?.with_env_overrides();
    info!(
        tick_hz = config.tick_hz,
        max_present_hz = config.max_present_hz,
        metrics_log_interval_ms = config.metrics_log_interval().as_millis() as u64,
        max_idle_sleep_ms = config.max_idle_sleep().as_millis() as u64,
        "cadence_config"
    );
    Ok(config)
}

fn resolve_base_config(
    raw_path: Result<String, env::VarError>,
) -> Result<CadenceConfig, ConfigError> {
    match raw_path {
        Ok(path) if !path.trim().is_empty() => CadenceConfig::load(Path::new(path.trim())),
        Ok(_) | Err(env::VarError::NotPresent) => Ok(CadenceConfig::default()),
        Err(err) => {
            warn!(
                env_var = CONFIG_PATH_ENV_VAR,
                error = %err,
                "unable to read config path env var; using defaults"
            );
            Ok(CadenceConfig::default())
        }
    }
}
