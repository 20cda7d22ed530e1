//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::HttpdConfig;
use crate::config::validation::{validate_config, ConfigurationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ConfigurationError>),
}

fn join_errors(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<HttpdConfig, ConfigError> {
    let config: HttpdConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<HttpdConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}
