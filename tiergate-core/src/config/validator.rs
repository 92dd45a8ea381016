//! Cross-field configuration validation

use super::error::{ValidationError, ValidationErrorKind};
use super::schema::GatewayConfig;
use crate::protocol::ModelCategory;
use std::net::SocketAddr;
use tracing::warn;

/// Configuration validator layering semantic rules over [`GatewayConfig::validate`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a configuration with extended rules
    pub fn validate(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        config.validate()?;

        self.validate_enabled_providers(config)?;
        self.validate_aliases(config)?;
        self.validate_cache(config)?;
        self.validate_server(config)?;

        Ok(())
    }

    fn validate_enabled_providers(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        let enabled_count = config.providers.iter().filter(|p| p.enabled).count();
        if enabled_count == 0 {
            return Err(ValidationError::custom(
                "providers",
                "At least one provider must be enabled",
            ));
        }

        for (i, provider) in config.providers.iter().enumerate() {
            if provider.enabled && provider.categories().is_empty() {
                return Err(ValidationError::required(format!("providers[{}].models", i))
                    .with_context("An enabled provider must offer at least one category"));
            }
        }

        for category in ModelCategory::ALL {
            let offered = config
                .providers
                .iter()
                .any(|p| p.enabled && p.offers(category));
            if !offered {
                warn!("No enabled provider offers the '{}' category", category);
            }
        }

        Ok(())
    }

    fn validate_aliases(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        for (alias, category) in &config.model_aliases {
            if alias.trim().is_empty() {
                return Err(ValidationError::invalid_value(
                    "model_aliases",
                    "non-empty model name",
                    format!("'{}'", alias),
                ));
            }

            let served = config
                .providers
                .iter()
                .any(|p| p.enabled && p.offers(*category));
            if !served {
                return Err(ValidationError::new(
                    format!("model_aliases.{}", alias),
                    ValidationErrorKind::Incompatible {
                        message: format!("no enabled provider offers category '{}'", category),
                    },
                ));
            }
        }

        Ok(())
    }

    fn validate_cache(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        let Some(redis_url) = &config.cache.redis_url else {
            return Ok(());
        };

        match url::Url::parse(redis_url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => Ok(()),
            Ok(url) => Err(ValidationError::invalid_value(
                "cache.redis_url",
                "redis:// or rediss:// URL",
                url.scheme().to_string(),
            )),
            Err(e) => Err(ValidationError::new(
                "cache.redis_url",
                ValidationErrorKind::InvalidUrl {
                    message: e.to_string(),
                },
            )),
        }
    }

    fn validate_server(&self, config: &GatewayConfig) -> Result<(), ValidationError> {
        if config.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::invalid_value(
                "server.bind",
                "socket address (host:port)",
                config.server.bind.clone(),
            ));
        }

        if config.server.heartbeat_interval_secs == 0 {
            return Err(ValidationError::out_of_range(
                "server.heartbeat_interval_secs",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}
