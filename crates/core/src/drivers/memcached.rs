//! Memcached driver
//!
//! The client is blocking, so every call runs on the blocking pool. Memcached
//! expires entries itself with one-second granularity; expiries are rounded
//! up to the next second. Keys memcached would reject (too long, whitespace
//! or control characters) are stored under their SHA-256 instead. There is
//! no way to enumerate a memcached server, so this driver cannot `list()`.

use super::{Cleanable, Clearable, Destroyable, Driver, HasKey, Lockable, Sizeable};
use crate::config::{CacheSettings, MemcachedSettings};
use crate::errors::{CacheError, Result};
use crate::hashing::hash_bytes;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memcache::MemcacheError;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DRIVER: &str = "memcached";

/// Longest key the memcached protocol accepts
const MAX_KEY_LEN: usize = 250;

/// Expirations above this many seconds are read as unix timestamps
const RELATIVE_EXPIRY_LIMIT: i64 = 60 * 60 * 24 * 30;

/// Driver talking to a memcached server
pub struct MemcachedDriver {
    settings: MemcachedSettings,
    client: RwLock<Option<Arc<memcache::Client>>>,
}

impl std::fmt::Debug for MemcachedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedDriver")
            .field("url", &self.settings.url)
            .field("connected", &self.client.read().is_some())
            .finish()
    }
}

/// Key sent to the server for `key`
fn backend_key(key: &str) -> Cow<'_, str> {
    let acceptable = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.chars().any(|c| c.is_whitespace() || c.is_control());
    if acceptable {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(hash_bytes(key.as_bytes()))
    }
}

/// Memcached expiration for `expiry`, `None` once it has passed
///
/// `0` means no expiry.
fn expiration(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u32> {
    let Some(at) = expiry else {
        return Some(0);
    };
    let millis = (at - now).num_milliseconds();
    if millis <= 0 {
        return None;
    }
    let seconds = (millis + 999) / 1000;
    if seconds <= RELATIVE_EXPIRY_LIMIT {
        return u32::try_from(seconds).ok();
    }
    Some(u32::try_from(at.timestamp()).unwrap_or(u32::MAX))
}

impl MemcachedDriver {
    /// Keep the settings; connecting waits for `can_load`
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            settings: settings.drivers.memcached.clone(),
            client: RwLock::new(None),
        }
    }

    /// Run one client call on the blocking pool
    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> std::result::Result<T, MemcacheError> + Send + 'static,
    {
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| CacheError::backend(DRIVER, operation, "connection is not open"))?;
        tokio::task::spawn_blocking(move || call(client.as_ref()))
            .await
            .map_err(|e| CacheError::backend(DRIVER, operation, e.to_string()))?
            .map_err(|e| CacheError::backend_with_source(DRIVER, operation, e))
    }

    async fn fetch(&self, operation: &'static str, key: &str) -> Result<Option<Vec<u8>>> {
        let key = backend_key(key).into_owned();
        self.call(operation, move |client| client.get::<Vec<u8>>(&key))
            .await
    }
}

#[async_trait]
impl Driver for MemcachedDriver {
    fn id(&self) -> &str {
        DRIVER
    }

    async fn can_load(&self) -> Result<bool> {
        let url = self.settings.url.clone();
        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let connect = tokio::task::spawn_blocking(move || {
            let client = memcache::Client::connect(url.as_str())?;
            client.version()?;
            Ok::<_, MemcacheError>(client)
        });

        let client = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(Ok(client))) => client,
            Ok(Ok(Err(e))) => return Err(CacheError::driver_unavailable(DRIVER, e.to_string())),
            Ok(Err(e)) => return Err(CacheError::driver_unavailable(DRIVER, e.to_string())),
            Err(_) => return Err(CacheError::timeout("memcached connect", timeout)),
        };
        info!(url = %self.settings.url, "connected to memcached");
        *self.client.write() = Some(Arc::new(client));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.fetch("get", key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()> {
        let Some(expiration) = expiration(expiry, Utc::now()) else {
            return self.unset(key).await;
        };
        let key = backend_key(key).into_owned();
        self.call("set", move |client| {
            client.set(&key, value.as_slice(), expiration)
        })
        .await
    }

    async fn unset(&self, key: &str) -> Result<()> {
        let key = backend_key(key).into_owned();
        self.call("unset", move |client| client.delete(&key))
            .await?;
        Ok(())
    }

    fn as_has(&self) -> Option<&dyn HasKey> {
        Some(self)
    }

    fn as_sizeable(&self) -> Option<&dyn Sizeable> {
        Some(self)
    }

    fn as_cleanable(&self) -> Option<&dyn Cleanable> {
        Some(self)
    }

    fn as_clearable(&self) -> Option<&dyn Clearable> {
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
impl HasKey for MemcachedDriver {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.fetch("has", key).await?.is_some())
    }
}

#[async_trait]
impl Sizeable for MemcachedDriver {
    async fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self
            .fetch("size", key)
            .await?
            .map(|value| value.len() as u64))
    }
}

#[async_trait]
impl Cleanable for MemcachedDriver {
    async fn clean(&self) -> Result<()> {
        debug!("memcached expires entries itself, nothing to clean");
        Ok(())
    }
}

#[async_trait]
impl Clearable for MemcachedDriver {
    async fn clear(&self) -> Result<()> {
        self.call("clear", |client| client.flush()).await
    }
}

#[async_trait]
impl Destroyable for MemcachedDriver {
    async fn destroy(&self) -> Result<()> {
        self.client.write().take();
        Ok(())
    }
}

#[async_trait]
impl Lockable for MemcachedDriver {
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some(expiration) = expiration(expiry, Utc::now()) else {
            return Ok(false);
        };
        let backend = backend_key(key).into_owned();
        // `add` only stores when the key is absent
        match self
            .call("lock_acquire", move |client| {
                client.add(&backend, value.as_slice(), expiration)
            })
            .await
        {
            Ok(()) => Ok(true),
            // The client reports NOT_STORED as an error; only a present key means "held"
            Err(e) => {
                if self.fetch("lock_acquire", key).await?.is_some() {
                    debug!(key, error = %e, "lock already held");
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some(expiration) = expiration(expiry, Utc::now()) else {
            return self.lock_release(key).await.map(|_| false);
        };
        let backend = backend_key(key).into_owned();
        // `replace` only stores when the key is present
        match self
            .call("lock_hydrate", move |client| {
                client.replace(&backend, value.as_slice(), expiration)
            })
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                if self.fetch("lock_hydrate", key).await?.is_some() {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn lock_release(&self, key: &str) -> Result<bool> {
        let key = backend_key(key).into_owned();
        self.call("lock_release", move |client| client.delete(&key))
            .await
    }

    async fn lock_exists(&self, key: &str) -> Result<bool> {
        Ok(self.fetch("lock_exists", key).await?.is_some())
    }
}
