//! Two-tier read-through cache
//!
//! The fast tier is an in-process `moka` cache with LRU eviction and
//! per-entry TTL. The optional backing tier is shared between gateway
//! instances and is authoritative whenever it is reachable. Backing-tier
//! failures are logged and counted, never returned to the caller.

mod redis;

pub use self::redis::RedisStore;

use crate::config::CacheSettings;
use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Backing tier failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Backing store connection failed: {0}")]
    Connection(String),

    #[error("Backing store command failed: {0}")]
    Command(String),

    #[error("Backing store call exceeded {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Cached value could not be encoded: {0}")]
    Serialization(String),
}

impl From<CacheError> for crate::providers::GatewayError {
    fn from(err: CacheError) -> Self {
        crate::providers::GatewayError::CacheBackend(err.to_string())
    }
}

/// Value read from the backing tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingEntry {
    pub value: String,
    /// Time left before the backing tier drops the entry, when it has one
    pub ttl: Option<Duration>,
}

/// Shared store behind the fast tier
#[async_trait]
pub trait BackingStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<BackingEntry>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

/// Tier a value was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Fast,
    Backing,
}

#[derive(Debug, Clone)]
struct FastEntry {
    value: Arc<str>,
    ttl: Duration,
}

struct EntryTtl;

impl Expiry<String, FastEntry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &FastEntry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &FastEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Counters reported on the admin surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub backing: Option<&'static str>,
    pub fast_hits: u64,
    pub backing_hits: u64,
    pub misses: u64,
    pub backing_errors: u64,
    pub fast_entries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fast_hits: AtomicU64,
    backing_hits: AtomicU64,
    misses: AtomicU64,
    backing_errors: AtomicU64,
}

/// Fast tier plus optional backing tier
#[derive(Clone)]
pub struct MultiLevelCache {
    enabled: bool,
    fast: Cache<String, FastEntry>,
    backing: Option<Arc<dyn BackingStore>>,
    default_ttl: Duration,
    backing_timeout: Duration,
    key_prefix: String,
    counters: Arc<Counters>,
}

impl fmt::Debug for MultiLevelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("enabled", &self.enabled)
            .field("backing", &self.backing.as_ref().map(|b| b.name()))
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl MultiLevelCache {
    /// Build from settings, connecting a redis backing tier when configured
    pub fn from_settings(settings: &CacheSettings) -> Result<Self, CacheError> {
        let backing = match &settings.redis_url {
            Some(url) if settings.enabled => {
                Some(Arc::new(RedisStore::new(url)?) as Arc<dyn BackingStore>)
            }
            _ => None,
        };
        Ok(Self::with_backing(settings, backing))
    }

    pub fn with_backing(settings: &CacheSettings, backing: Option<Arc<dyn BackingStore>>) -> Self {
        let fast = Cache::builder()
            .max_capacity(settings.fast_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryTtl)
            .build();

        Self {
            enabled: settings.enabled,
            fast,
            backing,
            default_ttl: Duration::from_secs(settings.default_ttl_secs),
            backing_timeout: Duration::from_millis(settings.backing_timeout_ms),
            key_prefix: settings.key_prefix.clone(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cache that never stores anything
    pub fn disabled() -> Self {
        Self::with_backing(
            &CacheSettings {
                enabled: false,
                ..CacheSettings::default()
            },
            None,
        )
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn backing_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn bounded<T>(
        &self,
        op: &str,
        key: &str,
        call: impl std::future::Future<Output = Result<T, CacheError>>,
    ) -> Option<T> {
        let outcome = match tokio::time::timeout(self.backing_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.backing_timeout)),
        };
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                self.counters.backing_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Backing cache {} failed for '{}', continuing with fast tier: {}", op, key, e);
                None
            }
        }
    }

    /// Look a key up, fast tier first
    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_with_tier(key).await.map(|(value, _)| value)
    }

    /// Like [`MultiLevelCache::get`], also reporting which tier answered
    pub async fn get_with_tier(&self, key: &str) -> Option<(String, CacheTier)> {
        if !self.enabled {
            return None;
        }

        if let Some(entry) = self.fast.get(key).await {
            self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
            return Some((entry.value.to_string(), CacheTier::Fast));
        }

        if let Some(backing) = &self.backing {
            let backing_key = self.backing_key(key);
            if let Some(Some(entry)) = self.bounded("get", key, backing.get(&backing_key)).await {
                self.counters.backing_hits.fetch_add(1, Ordering::Relaxed);
                // never outlive the backing copy
                let ttl = entry
                    .ttl
                    .map_or(self.default_ttl, |left| left.min(self.default_ttl));
                self.fast
                    .insert(
                        key.to_string(),
                        FastEntry {
                            value: Arc::from(entry.value.as_str()),
                            ttl,
                        },
                    )
                    .await;
                return Some((entry.value, CacheTier::Backing));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write both tiers; `None` uses the default TTL
    pub async fn set(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let value: String = value.into();
        let ttl = ttl.unwrap_or(self.default_ttl);

        if let Some(backing) = &self.backing {
            let backing_key = self.backing_key(key);
            self.bounded("set", key, backing.set(&backing_key, &value, ttl)).await;
        }

        self.fast
            .insert(
                key.to_string(),
                FastEntry {
                    value: Arc::from(value),
                    ttl,
                },
            )
            .await;
        debug!("Cached '{}' for {:?}", key, ttl);
    }

    pub async fn invalidate(&self, key: &str) {
        self.fast.invalidate(key).await;
        if let Some(backing) = &self.backing {
            let backing_key = self.backing_key(key);
            self.bounded("delete", key, backing.delete(&backing_key)).await;
        }
    }

    /// Typed read; undecodable values count as a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Discarding undecodable cache entry '{}': {}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(e) => warn!("{}", CacheError::Serialization(e.to_string())),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        self.fast.run_pending_tasks().await;
        CacheStats {
            enabled: self.enabled,
            backing: self.backing.as_ref().map(|b| b.name()),
            fast_hits: self.counters.fast_hits.load(Ordering::Relaxed),
            backing_hits: self.counters.backing_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            backing_errors: self.counters.backing_errors.load(Ordering::Relaxed),
            fast_entries: self.fast.entry_count(),
        }
    }
}
