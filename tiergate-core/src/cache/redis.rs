//! Redis backing tier
//!
//! Values are stored as JSON strings under `SETEX` so the backing tier
//! expires entries on its own schedule. Reads fetch the remaining `PTTL`
//! alongside the value.

use super::{BackingEntry, BackingStore, CacheError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared cache tier backed by a redis server
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr.to_string())
            .finish()
    }
}

impl RedisStore {
    /// Create the client; no connection is made until first use
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Connection(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        *self.connection.lock().await = None;
    }

    async fn command_failed(&self, op: &str, err: redis::RedisError) -> CacheError {
        if err.is_io_error() || err.is_connection_dropped() {
            self.forget_connection().await;
        }
        CacheError::Command(format!("{} failed: {}", op, err))
    }
}

/// `PTTL` answers -1 for keys without expiry and -2 for missing keys
fn remaining_ttl(millis: i64) -> Option<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<BackingEntry>, CacheError> {
        let mut conn = self.connection().await?;
        let reply = redis::pipe()
            .atomic()
            .get(key)
            .pttl(key)
            .query_async::<(Option<String>, i64)>(&mut conn)
            .await;
        match reply {
            Ok((value, millis)) => Ok(value.map(|value| BackingEntry {
                value,
                ttl: remaining_ttl(millis),
            })),
            Err(e) => Err(self.command_failed("GET", e).await),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        match conn.set_ex::<_, _, ()>(key, value, seconds).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.command_failed("SETEX", e).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        match conn.del::<_, i64>(key).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.command_failed("DEL", e).await),
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        let err = RedisStore::new("not a url").unwrap_err();
        assert!(matches!(err, CacheError::Connection(_)));
    }

    #[test]
    fn test_accepts_url_without_connecting() {
        let store = RedisStore::new("redis://127.0.0.1:1/").unwrap();
        assert_eq!(store.name(), "redis");
    }

    #[test]
    fn test_remaining_ttl_from_pttl() {
        assert_eq!(remaining_ttl(1500), Some(Duration::from_millis(1500)));
        assert_eq!(remaining_ttl(0), None);
        assert_eq!(remaining_ttl(-1), None);
        assert_eq!(remaining_ttl(-2), None);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let store = RedisStore::new("redis://127.0.0.1:1/").unwrap();
        assert!(store.get("k").await.is_err());
    }
}
