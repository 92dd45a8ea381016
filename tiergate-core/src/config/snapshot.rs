//! Versioned, atomically swapped configuration snapshots
//!
//! Requests capture one [`ConfigSnapshot`] when they start and keep it for
//! their whole lifetime; a reload only affects requests that start afterwards.

use super::error::{ConfigError, ConfigResult};
use super::schema::{GatewayConfig, ProviderConfig};
use super::validator::ConfigValidator;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

/// One immutable configuration generation
#[derive(Debug)]
pub struct ConfigSnapshot {
    /// Monotonically increasing generation number, starting at 1
    pub version: u64,
    pub config: GatewayConfig,
    /// Providers in configuration order
    pub providers: Vec<Arc<ProviderConfig>>,
    pub loaded_at: SystemTime,
}

impl ConfigSnapshot {
    fn new(version: u64, config: GatewayConfig) -> Self {
        let providers = config.providers.iter().cloned().map(Arc::new).collect();
        Self {
            version,
            config,
            providers,
            loaded_at: SystemTime::now(),
        }
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<ProviderConfig>> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Shared pointer to the live snapshot
#[derive(Debug)]
pub struct ConfigHandle {
    current: ArcSwap<ConfigSnapshot>,
    last_version: AtomicU64,
    validator: ConfigValidator,
}

impl ConfigHandle {
    /// Validate the initial document and publish it as version 1
    pub fn new(config: GatewayConfig) -> ConfigResult<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::new(1, config)),
            last_version: AtomicU64::new(1),
            validator,
        })
    }

    /// Current snapshot; the returned `Arc` stays valid across later swaps
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Validate and atomically publish a new generation.
    ///
    /// A rejected document leaves the live snapshot untouched.
    pub fn replace(&self, config: GatewayConfig) -> ConfigResult<Arc<ConfigSnapshot>> {
        if let Err(err) = self.validator.validate(&config) {
            let current_version = self.version();
            warn!(
                "Configuration reload rejected, keeping v{}: {}",
                current_version, err
            );
            return Err(ConfigError::ReloadRejected {
                current_version,
                reason: err.to_string(),
            });
        }

        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(ConfigSnapshot::new(version, config));
        self.current.store(Arc::clone(&snapshot));

        info!(
            "Configuration v{} published with {} providers",
            version,
            snapshot.providers.len()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(priority: u32) -> GatewayConfig {
        serde_json::from_value(json!({
            "providers": [{
                "name": "a",
                "priority": priority,
                "base_url": "https://api.example.com",
                "api_key": "sk-test-123456789",
                "models": {"middle": ["mid-1"]}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_replace_bumps_version_and_keeps_old_snapshot_alive() {
        let handle = ConfigHandle::new(config(2)).unwrap();
        let before = handle.load();
        assert_eq!(before.version, 1);

        let after = handle.replace(config(0)).unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(handle.version(), 2);

        assert_eq!(before.providers[0].priority, 2);
        assert_eq!(handle.load().providers[0].priority, 0);
    }

    #[test]
    fn test_rejected_reload_keeps_current() {
        let handle = ConfigHandle::new(config(1)).unwrap();
        let mut bad = config(1);
        bad.providers.clear();

        match handle.replace(bad) {
            Err(ConfigError::ReloadRejected { current_version, .. }) => {
                assert_eq!(current_version, 1)
            }
            other => panic!("expected rejection, got {:?}", other.map(|s| s.version)),
        }
        assert_eq!(handle.version(), 1);
    }
}
