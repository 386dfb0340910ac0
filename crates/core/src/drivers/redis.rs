//! Redis driver
//!
//! Expiry maps onto `PXAT`, so Redis drops expired keys itself and `clean()`
//! has nothing to do. Locks use `SET NX` / `SET XX`.

use super::{Cleanable, Destroyable, Driver, HasKey, ListEntry, Listable, Lockable, Sizeable};
use crate::config::CacheSettings;
use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

const DRIVER: &str = "redis";

/// Driver talking to a single Redis server over a multiplexed connection
pub struct RedisDriver {
    client: redis::Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    key_query: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RedisDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDriver")
            .field("connected", &self.connection.read().is_some())
            .field("key_query", &self.key_query)
            .finish()
    }
}

impl RedisDriver {
    /// Parse the connection URL; no I/O happens until `can_load`
    pub fn new(settings: &CacheSettings) -> Result<Self> {
        let redis = &settings.drivers.redis;
        let client = redis::Client::open(redis.url.as_str())
            .map_err(|e| CacheError::driver_unavailable(DRIVER, e.to_string()))?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            key_query: settings.key_query.clone(),
            connect_timeout: Duration::from_millis(redis.connect_timeout_ms),
        })
    }

    fn connection(&self, operation: &'static str) -> Result<MultiplexedConnection> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| CacheError::backend(DRIVER, operation, "connection is not open"))
    }

    /// `SET key value [NX|XX] [PXAT ms]`, returning whether the write happened
    async fn set_with(
        &self,
        operation: &'static str,
        key: &str,
        value: Vec<u8>,
        condition: Option<&'static str>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.connection(operation)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(condition) = condition {
            cmd.arg(condition);
        }
        if let Some(expiry) = expiry {
            cmd.arg("PXAT").arg(expiry.timestamp_millis());
        }
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, operation, e))?;
        Ok(reply.is_some())
    }

    async fn exists(&self, operation: &'static str, key: &str) -> Result<bool> {
        let mut conn = self.connection(operation)?;
        conn.exists(key)
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, operation, e))
    }
}

#[async_trait]
impl Driver for RedisDriver {
    fn id(&self) -> &str {
        DRIVER
    }

    async fn can_load(&self) -> Result<bool> {
        let connect = self.client.get_multiplexed_async_connection();
        let conn = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(CacheError::driver_unavailable(DRIVER, e.to_string())),
            Err(_) => return Err(CacheError::timeout("redis connect", self.connect_timeout)),
        };
        info!("connected to redis");
        *self.connection.write() = Some(conn);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection("get")?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, "get", e))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()> {
        self.set_with("set", key, value, None, expiry).await?;
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection("unset")?;
        let _: i64 = conn
            .del(key)
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, "unset", e))?;
        Ok(())
    }

    fn as_has(&self) -> Option<&dyn HasKey> {
        Some(self)
    }

    fn as_sizeable(&self) -> Option<&dyn Sizeable> {
        Some(self)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        Some(self)
    }

    fn as_cleanable(&self) -> Option<&dyn Cleanable> {
        Some(self)
    }

    fn as_destroyable(&self) -> Option<&dyn Destroyable> {
        Some(self)
    }

    fn as_lockable(&self) -> Option<&dyn Lockable> {
        Some(self)
    }
}

#[async_trait]
impl HasKey for RedisDriver {
    async fn has(&self, key: &str) -> Result<bool> {
        self.exists("has", key).await
    }
}

#[async_trait]
impl Sizeable for RedisDriver {
    async fn size(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.connection("size")?;
        let len: u64 = conn
            .strlen(key)
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, "size", e))?;
        // STRLEN answers 0 for missing keys too
        if len == 0 && !self.exists("size", key).await? {
            return Ok(None);
        }
        Ok(Some(len))
    }
}

#[async_trait]
impl Listable for RedisDriver {
    async fn list(&self) -> Result<Vec<ListEntry>> {
        let mut conn = self.connection("list")?;
        let keys: Vec<String> = conn
            .keys(self.key_query.as_str())
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, "list", e))?;
        Ok(keys.into_iter().map(ListEntry::new).collect())
    }
}

#[async_trait]
impl Cleanable for RedisDriver {
    async fn clean(&self) -> Result<()> {
        debug!("redis expires keys itself, nothing to clean");
        Ok(())
    }
}

#[async_trait]
impl Destroyable for RedisDriver {
    async fn destroy(&self) -> Result<()> {
        // Dropping the last handle closes the multiplexed connection
        self.connection.write().take();
        Ok(())
    }
}

#[async_trait]
impl Lockable for RedisDriver {
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.set_with("lock_acquire", key, value, Some("NX"), expiry)
            .await
    }

    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.set_with("lock_hydrate", key, value, Some("XX"), expiry)
            .await
    }

    async fn lock_release(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection("lock_release")?;
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, "lock_release", e))?;
        Ok(removed > 0)
    }

    async fn lock_exists(&self, key: &str) -> Result<bool> {
        self.exists("lock_exists", key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected_without_io() {
        let settings = CacheSettings::builder()
            .with_redis(crate::config::RedisSettings {
                url: "not a url".to_string(),
                ..Default::default()
            })
            .build();
        assert!(RedisDriver::new(&settings).is_err());
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let driver = RedisDriver::new(&CacheSettings::default()).unwrap();
        let err = driver.get("foo").await.unwrap_err();
        assert!(matches!(err, CacheError::Backend { .. }));
    }
}
