//! Configuration loading

use anyhow::Result;
use std::path::Path;

use crate::Config;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "BEACON_CONFIG_PATH";

const DEFAULT_CONFIG_FILE: &str = "beacon.yaml";

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. `explicit` argument (e.g. `--config`)
/// 2. `BEACON_CONFIG_PATH` environment variable
/// 3. ./beacon.yaml
/// 4. Fall back to environment variables only
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = match explicit {
        Some(path) if !Path::new(path).exists() => {
            return Err(anyhow::anyhow!("Config file {path} not found"));
        }
        Some(path) => Some(path.to_string()),
        None => std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| Path::new(p).exists())
            .or_else(|| {
                Path::new(DEFAULT_CONFIG_FILE)
                    .exists()
                    .then(|| DEFAULT_CONFIG_FILE.to_string())
            }),
    };

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
        }
        None => Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?,
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    Ok(config)
}
