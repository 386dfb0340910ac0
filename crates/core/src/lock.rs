//! Locking primitive built on a driver's atomic conditional writes
//!
//! Lock identifiers are any serializable value. They are hashed into a fixed
//! `lock:<sha256>` key, so structurally equal identifiers name the same lock,
//! and the key then goes through the configured key mangle. The record value
//! is the owner data, `null` when none was supplied.

use crate::cache::{ActiveModule, Cache};
use crate::drivers::Lockable;
use crate::errors::{CacheError, Result};
use crate::expiry::Expiry;
use crate::hashing::hash;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Delay before the next attempt, given the 1-based attempt that just failed
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Observer called with a 1-based attempt number
pub type AttemptHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Options for [`Cache::lock_spin`]
#[derive(Clone)]
pub struct SpinOptions {
    /// Extra attempts after the first one
    pub retries: u32,
    /// Base delay; the default backoff waits `delay × attempt`
    pub delay: Duration,
    /// Upper bound of the random delay added by the default backoff
    pub jitter: Duration,
    /// Expiry of the lock record once acquired
    pub expiry: Expiry,
    /// Replaces the default backoff entirely
    pub backoff: Option<Backoff>,
    pub on_locked: Option<AttemptHook>,
    pub on_acquired: Option<AttemptHook>,
    /// Called with the total number of attempts before `LockExhausted` is returned
    pub on_exhausted: Option<AttemptHook>,
}

impl Default for SpinOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_millis(250),
            jitter: Duration::from_millis(100),
            expiry: Expiry::Never,
            backoff: None,
            on_locked: None,
            on_acquired: None,
            on_exhausted: None,
        }
    }
}

impl fmt::Debug for SpinOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinOptions")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .field("jitter", &self.jitter)
            .field("expiry", &self.expiry)
            .field("backoff", &self.backoff.is_some())
            .finish_non_exhaustive()
    }
}

impl SpinOptions {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_expiry(mut self, expiry: impl Into<Expiry>) -> Self {
        self.expiry = expiry.into();
        self
    }

    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    pub fn on_locked<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_locked = Some(Arc::new(hook));
        self
    }

    pub fn on_acquired<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_acquired = Some(Arc::new(hook));
        self
    }

    pub fn on_exhausted<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_exhausted = Some(Arc::new(hook));
        self
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        if let Some(backoff) = &self.backoff {
            return backoff(attempt);
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(fastrand::u64(0..=jitter_ms));
        self.delay.saturating_mul(attempt) + jitter
    }
}

/// Backend key for a lock identifier, before key mangling
pub fn lock_key<K: Serialize + ?Sized>(id: &K) -> Result<String> {
    Ok(format!("lock:{}", hash(id)?))
}

fn lockable<'a>(active: &'a ActiveModule, operation: &'static str) -> Result<&'a dyn Lockable> {
    active
        .driver
        .as_lockable()
        .ok_or_else(|| CacheError::unsupported(operation, &active.id))
}

impl Cache {
    /// Bound driver and mangled backend key for a lock operation
    fn lock_target<K>(&self, operation: &'static str, id: &K) -> Result<(Arc<ActiveModule>, String)>
    where
        K: Serialize + ?Sized,
    {
        let active = self.active(operation)?;
        lockable(&active, operation)?;
        let key = self.inner.settings.mangle(&lock_key(id)?);
        trace!(operation, key = %key, "lock operation");
        Ok((active, key))
    }

    /// Take the lock if no live holder exists
    pub async fn lock_acquire<K>(&self, id: &K, expiry: impl Into<Expiry>) -> Result<bool>
    where
        K: Serialize + ?Sized,
    {
        self.lock_acquire_with(id, &Value::Null, expiry).await
    }

    /// Take the lock, storing `data` as the owner record
    pub async fn lock_acquire_with<K, D>(
        &self,
        id: &K,
        data: &D,
        expiry: impl Into<Expiry>,
    ) -> Result<bool>
    where
        K: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        let (active, key) = self.lock_target("lock_acquire", id)?;
        let expiry = self.resolve_future_expiry(&expiry.into())?;
        let value = self.encode(&key, data)?;
        let _guard = self.track_write();
        let acquired = lockable(&active, "lock_acquire")?
            .lock_acquire(&key, value, expiry)
            .await?;
        debug!(acquired, "lock_acquire");
        Ok(acquired)
    }

    /// Refresh the expiry of a held lock; false when nobody holds it
    pub async fn lock_hydrate<K>(&self, id: &K, expiry: impl Into<Expiry>) -> Result<bool>
    where
        K: Serialize + ?Sized,
    {
        self.lock_hydrate_with(id, &Value::Null, expiry).await
    }

    /// Replace the owner data and expiry of a held lock
    pub async fn lock_hydrate_with<K, D>(
        &self,
        id: &K,
        data: &D,
        expiry: impl Into<Expiry>,
    ) -> Result<bool>
    where
        K: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        let (active, key) = self.lock_target("lock_hydrate", id)?;
        let expiry = self.resolve_future_expiry(&expiry.into())?;
        let value = self.encode(&key, data)?;
        let _guard = self.track_write();
        lockable(&active, "lock_hydrate")?
            .lock_hydrate(&key, value, expiry)
            .await
    }

    /// Remove the lock; true iff a live record was removed
    pub async fn lock_release<K>(&self, id: &K) -> Result<bool>
    where
        K: Serialize + ?Sized,
    {
        let (active, key) = self.lock_target("lock_release", id)?;
        let _guard = self.track_write();
        let released = lockable(&active, "lock_release")?
            .lock_release(&key)
            .await?;
        debug!(released, "lock_release");
        Ok(released)
    }

    pub async fn lock_exists<K>(&self, id: &K) -> Result<bool>
    where
        K: Serialize + ?Sized,
    {
        let (active, key) = self.lock_target("lock_exists", id)?;
        lockable(&active, "lock_exists")?.lock_exists(&key).await
    }

    /// Owner data of a held lock; `None` when unheld or acquired without data
    pub async fn lock_data<T, K>(&self, id: &K) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        K: Serialize + ?Sized,
    {
        let (active, key) = self.lock_target("lock_data", id)?;
        let Some(bytes) = active.driver.get(&key).await? else {
            return Ok(None);
        };
        match self.decode::<Value>(&key, &bytes)? {
            Value::Null => Ok(None),
            value => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CacheError::decode(key, e.to_string())),
        }
    }

    /// Try to acquire the lock up to `retries + 1` times
    ///
    /// Returns `Ok(())` once acquired. When every attempt finds the lock held
    /// the `on_exhausted` observer runs and `LockExhausted` is returned.
    pub async fn lock_spin<K>(&self, id: &K, options: SpinOptions) -> Result<()>
    where
        K: Serialize + ?Sized,
    {
        let attempts = options.retries.saturating_add(1);
        let expiry = options.expiry.clone();

        for attempt in 1..=attempts {
            if self.lock_acquire(id, expiry.clone()).await? {
                debug!(attempt, "lock acquired");
                if let Some(hook) = &options.on_acquired {
                    hook(attempt);
                }
                return Ok(());
            }

            if let Some(hook) = &options.on_locked {
                hook(attempt);
            }
            if attempt < attempts {
                let wait = options.delay_after(attempt);
                trace!(attempt, ?wait, "lock held, backing off");
                tokio::time::sleep(wait).await;
            }
        }

        if let Some(hook) = &options.on_exhausted {
            hook(attempts);
        }
        Err(CacheError::LockExhausted {
            key: lock_key(id)?,
            attempts,
        })
    }
}
