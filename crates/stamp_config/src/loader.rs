//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::StampConfig;
use std::path::Path;

/// Name of the configuration file within a project directory.
pub const CONFIG_FILE: &str = "stamp.toml";

/// Loads and validates a `stamp.toml` configuration from a project directory.
///
/// A missing file yields the default configuration. Relative cache
/// directories are resolved against `project_dir`.
pub fn load_config(project_dir: &Path) -> Result<StampConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let mut config = StampConfig::default();
        config.cache.dir = project_dir.join(&config.cache.dir);
        return Ok(config);
    }
    let content = std::fs::read_to_string(&config_path)?;
    let mut config = load_config_from_str(&content)?;
    if config.cache.dir.is_relative() {
        config.cache.dir = project_dir.join(&config.cache.dir);
    }
    Ok(config)
}

/// Parses and validates a `stamp.toml` configuration from a string.
pub fn load_config_from_str(content: &str) -> Result<StampConfig, ConfigError> {
    let config: StampConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &StampConfig) -> Result<(), ConfigError> {
    if config.cache.dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "cache.dir must not be empty".to_string(),
        ));
    }
    for id in config.compilers.keys() {
        if id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "compiler id must not be empty".to_string(),
            ));
        }
        if id.contains(['/', '\\']) {
            return Err(ConfigError::ValidationError(format!(
                "compiler id '{id}' must not contain path separators"
            )));
        }
    }
    Ok(())
}
