//! Configuration module for the gateway
//!
//! This module provides the configuration schema, validation, environment
//! interpolation and the atomically swapped snapshot handle.

mod env;
mod error;
mod schema;
mod secrets;
mod snapshot;
mod validator;

pub use error::{ConfigError, ConfigResult, ValidationError, ValidationErrorKind};
pub use schema::{
    CacheSettings, CategoryModels, CircuitBreakerSettings, FallbackStrategy, GatewayConfig,
    HealthSettings, ProviderConfig, RetrySettings, ServerSettings, WireFormat,
};
pub use secrets::{SafeLogging, SecretString};
pub use snapshot::{ConfigHandle, ConfigSnapshot};
pub use validator::ConfigValidator;

use std::fs;
use std::path::Path;

/// Document formats accepted by the loaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Guess from a file extension, defaulting to JSON
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") | None => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some(other) => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Load a configuration file, choosing the parser from its extension
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    parse_document(&content, format, &path.to_string_lossy())
}

/// Load a configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    parse_document(&content, ConfigFormat::Yaml, &path.to_string_lossy())
}

/// Load a configuration from a JSON file
pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    parse_document(&content, ConfigFormat::Json, &path.to_string_lossy())
}

/// Parse an in-memory document, as received by the reload endpoint
pub fn parse_document(
    content: &str,
    format: ConfigFormat,
    origin: &str,
) -> Result<GatewayConfig, ConfigError> {
    let interpolated = env::interpolate_env_vars(content)?;

    let mut config: GatewayConfig = match format {
        ConfigFormat::Json => {
            serde_json::from_str(&interpolated).map_err(|e| ConfigError::ParseError {
                path: origin.to_string(),
                line: Some(e.line()),
                column: Some(e.column()),
                message: e.to_string(),
            })?
        }
        ConfigFormat::Yaml => {
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseError {
                path: origin.to_string(),
                line: e.location().map(|l| l.line()),
                column: e.location().map(|l| l.column()),
                message: e.to_string(),
            })?
        }
    };

    interpolate_provider_fields(&mut config)?;

    ConfigValidator::new().validate(&config)?;
    Ok(config)
}

/// Second interpolation pass over credential and endpoint fields
fn interpolate_provider_fields(config: &mut GatewayConfig) -> Result<(), ConfigError> {
    for provider in &mut config.providers {
        if env::has_placeholder(provider.api_key.expose_secret()) {
            let value = env::interpolate_env_vars(provider.api_key.expose_secret())?;
            provider.api_key = SecretString::new(value);
        }

        if env::has_placeholder(&provider.base_url) {
            provider.base_url = env::interpolate_env_vars(&provider.base_url)?;
        }
    }

    Ok(())
}
