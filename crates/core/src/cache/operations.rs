//! Operation dispatch onto the bound driver

use super::types::{ActiveModule, Cache};
use crate::drivers::{Capabilities, Capability, ListEntry};
use crate::errors::{CacheError, Result};
use crate::expiry::{resolve_expiry, Expiry};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

impl Cache {
    /// Whether the bound driver can serve `capability`, natively or synthesized
    ///
    /// Always false before a driver is bound.
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities()
            .is_some_and(|caps| caps.can(capability))
    }

    /// Native capability set of the bound driver
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.active("can").ok().map(|active| active.capabilities)
    }

    /// Store a value
    ///
    /// `expiry` accepts anything convertible to [`Expiry`]: a timestamp, a
    /// duration, a number of milliseconds, a string like `"30s"` or `None`.
    pub async fn set<T>(&self, key: &str, value: &T, expiry: impl Into<Expiry>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let active = self.active("set")?;
        let expiry = self.resolve_future_expiry(&expiry.into())?;
        let bytes = self.encode(key, value)?;
        debug!(key, ?expiry, "set");

        let _guard = self.track_write();
        active
            .driver
            .set(&self.inner.settings.mangle(key), bytes, expiry)
            .await
    }

    /// Store several values in parallel with a shared expiry
    ///
    /// Every write is attempted; the first failure is returned and the
    /// successful writes are kept.
    pub async fn set_many<K, T, I>(&self, entries: I, expiry: impl Into<Expiry>) -> Result<()>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: Serialize,
    {
        let active = self.active("set")?;
        let expiry = self.resolve_future_expiry(&expiry.into())?;

        let writes = entries.into_iter().map(|(key, value)| {
            let active = Arc::clone(&active);
            async move {
                let key = key.as_ref();
                let bytes = self.encode(key, &value)?;
                debug!(key, ?expiry, "set");
                let _guard = self.track_write();
                active
                    .driver
                    .set(&self.inner.settings.mangle(key), bytes, expiry)
                    .await
            }
        });

        join_all(writes).await.into_iter().collect()
    }

    /// Read a value, `None` when absent or expired
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let active = self.active("get")?;
        debug!(key, "get");
        match active.driver.get(&self.inner.settings.mangle(key)).await? {
            Some(bytes) => self.decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Read a value or return `fallback`
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, fallback: T) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or(fallback))
    }

    /// Read several values in parallel; every requested key appears in the result
    pub async fn get_many<K, T, I>(&self, keys: I) -> Result<HashMap<String, Option<T>>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
        T: DeserializeOwned,
    {
        self.active("get")?;
        let reads = keys.into_iter().map(|key| async move {
            let key = key.as_ref();
            self.get::<T>(key).await.map(|value| (key.to_string(), value))
        });

        join_all(reads).await.into_iter().collect()
    }

    /// Whether a live entry exists
    ///
    /// Uses the driver's own check when available, otherwise reads the entry.
    pub async fn has(&self, key: &str) -> Result<bool> {
        let active = self.active("has")?;
        let key = self.inner.settings.mangle(key);
        debug!(key = %key, "has");
        match active.driver.as_has() {
            Some(has) => has.has(&key).await,
            None => Ok(active.driver.get(&key).await?.is_some()),
        }
    }

    /// Stored size of an entry in bytes
    pub async fn size(&self, key: &str) -> Result<Option<u64>> {
        let active = self.active("size")?;
        let sizeable = active
            .driver
            .as_sizeable()
            .ok_or_else(|| CacheError::unsupported("size", &active.id))?;
        debug!(key, "size");
        sizeable.size(&self.inner.settings.mangle(key)).await
    }

    /// Remove an entry; removing a missing key succeeds
    pub async fn unset(&self, key: &str) -> Result<()> {
        self.unset_many([key]).await
    }

    /// Remove several entries in parallel
    pub async fn unset_many<K, I>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let active = self.active("unset")?;
        let removals = keys.into_iter().map(|key| {
            let active = Arc::clone(&active);
            async move {
                debug!(key = key.as_ref(), "unset");
                let _guard = self.track_write();
                active
                    .driver
                    .unset(&self.inner.settings.mangle(key.as_ref()))
                    .await
            }
        });

        join_all(removals).await.into_iter().collect()
    }

    /// Enumerate live entries; ids are backend keys after mangling
    pub async fn list(&self) -> Result<Vec<ListEntry>> {
        let active = self.active("list")?;
        let listable = active
            .driver
            .as_listable()
            .ok_or_else(|| CacheError::unsupported("list", &active.id))?;
        debug!("list");
        listable.list().await
    }

    /// Drop expired entries
    pub async fn clean(&self) -> Result<()> {
        let active = self.active("clean")?;
        debug!(driver = %active.id, "clean");
        if let Some(cleanable) = active.driver.as_cleanable() {
            return cleanable.clean().await;
        }
        let now = Utc::now();
        self.unset_listed(&active, "clean", |entry| entry.is_expired_at(now))
            .await
    }

    /// Drop every entry
    pub async fn clear(&self) -> Result<()> {
        let active = self.active("clear")?;
        debug!(driver = %active.id, "clear");
        if let Some(clearable) = active.driver.as_clearable() {
            return clearable.clear().await;
        }
        self.unset_listed(&active, "clear", |_| true).await
    }

    /// Synthesized clean/clear: list, then unset the selected backend keys
    async fn unset_listed<F>(
        &self,
        active: &ActiveModule,
        operation: &'static str,
        select: F,
    ) -> Result<()>
    where
        F: Fn(&ListEntry) -> bool,
    {
        let listable = active
            .driver
            .as_listable()
            .ok_or_else(|| CacheError::unsupported(operation, &active.id))?;

        let doomed: Vec<ListEntry> = listable.list().await?.into_iter().filter(select).collect();
        debug!(operation, count = doomed.len(), "unsetting listed entries");

        let removals = doomed.iter().map(|entry| async move {
            let _guard = self.track_write();
            active.driver.unset(&entry.id).await
        });
        join_all(removals).await.into_iter().collect()
    }

    /// Resolve an expiry and reject timestamps strictly before now
    pub(crate) fn resolve_future_expiry(&self, expiry: &Expiry) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let resolved = resolve_expiry(expiry, now)?;
        match resolved {
            Some(at) if at < now => Err(CacheError::ExpiryInPast { expiry: at }),
            other => Ok(other),
        }
    }

    pub(crate) fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<Vec<u8>> {
        let value =
            serde_json::to_value(value).map_err(|e| CacheError::encode(key, e.to_string()))?;
        self.inner
            .settings
            .codec
            .serialize(&value)
            .map_err(|e| CacheError::encode(key, e))
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T> {
        let value = self
            .inner
            .settings
            .codec
            .deserialize(bytes)
            .map_err(|e| CacheError::decode(key, e))?;
        serde_json::from_value(value).map_err(|e| CacheError::decode(key, e.to_string()))
    }
}
