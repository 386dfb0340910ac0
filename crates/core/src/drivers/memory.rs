//! In-process driver backed by a concurrent map

use super::{
    is_live, key_matcher, Cleanable, Clearable, Destroyable, Driver, HasKey, ListEntry, Listable,
    Lockable, Sizeable,
};
use crate::config::CacheSettings;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expiry: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
}

impl MemoryEntry {
    fn new(value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            expiry,
            created: Utc::now(),
        }
    }
}

/// Always-available driver; contents live only as long as the process
#[derive(Debug)]
pub struct MemoryDriver {
    store: DashMap<String, MemoryEntry>,
    key_query: String,
    evict_on_read: bool,
}

impl MemoryDriver {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            store: DashMap::new(),
            key_query: settings.key_query.clone(),
            evict_on_read: settings.drivers.memory.evict_on_read,
        }
    }

    /// Number of physically stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn live(&self, key: &str) -> Option<MemoryEntry> {
        let now = Utc::now();
        let entry = self.store.get(key).map(|e| e.value().clone())?;
        if is_live(entry.expiry, now) {
            return Some(entry);
        }
        if self.evict_on_read {
            // Only drop the record if it is still the expired one we saw
            self.store.remove_if(key, |_, e| !is_live(e.expiry, now));
            trace!(key, "evicted expired memory entry");
        }
        None
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn id(&self) -> &str {
        "memory"
    }

    async fn can_load(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()> {
        self.store
            .insert(key.to_string(), MemoryEntry::new(value, expiry));
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        self.store.remove(key);
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
impl HasKey for MemoryDriver {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }
}

#[async_trait]
impl Sizeable for MemoryDriver {
    async fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.live(key).map(|entry| entry.value.len() as u64))
    }
}

#[async_trait]
impl Listable for MemoryDriver {
    async fn list(&self) -> Result<Vec<ListEntry>> {
        let matcher = key_matcher(&self.key_query)?;
        let now = Utc::now();
        Ok(self
            .store
            .iter()
            .filter(|item| is_live(item.expiry, now) && matcher.is_match(item.key()))
            .map(|item| ListEntry {
                id: item.key().clone(),
                expiry: item.expiry,
                created: Some(item.created),
            })
            .collect())
    }
}

#[async_trait]
impl Cleanable for MemoryDriver {
    async fn clean(&self) -> Result<()> {
        let now = Utc::now();
        self.store.retain(|_, entry| is_live(entry.expiry, now));
        Ok(())
    }
}

#[async_trait]
impl Clearable for MemoryDriver {
    async fn clear(&self) -> Result<()> {
        self.store.clear();
        Ok(())
    }
}

#[async_trait]
impl Destroyable for MemoryDriver {
    async fn destroy(&self) -> Result<()> {
        self.store.clear();
        Ok(())
    }
}

#[async_trait]
impl Lockable for MemoryDriver {
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now();
        // The entry guard holds the shard lock, making check-and-insert atomic
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if is_live(occupied.get().expiry, now) {
                    Ok(false)
                } else {
                    occupied.insert(MemoryEntry::new(value, expiry));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, expiry));
                Ok(true)
            }
        }
    }

    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now();
        match self.store.get_mut(key) {
            Some(mut existing) if is_live(existing.expiry, now) => {
                *existing = MemoryEntry::new(value, expiry);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_release(&self, key: &str) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .store
            .remove(key)
            .map(|(_, entry)| is_live(entry.expiry, now))
            .unwrap_or(false))
    }

    async fn lock_exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn driver() -> MemoryDriver {
        MemoryDriver::new(&CacheSettings::default())
    }

    #[tokio::test]
    async fn test_set_get_unset() {
        let driver = driver();
        driver.set("foo", b"Foo".to_vec(), None).await.unwrap();
        assert_eq!(driver.get("foo").await.unwrap(), Some(b"Foo".to_vec()));
        assert_eq!(driver.size("foo").await.unwrap(), Some(3));
        driver.unset("foo").await.unwrap();
        driver.unset("foo").await.unwrap();
        assert_eq!(driver.get("foo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent_and_evicted() {
        let driver = driver();
        let past = Utc::now() - chrono::Duration::seconds(1);
        driver.set("old", b"1".to_vec(), Some(past)).await.unwrap();
        assert_eq!(driver.len(), 1);

        assert!(!driver.has("old").await.unwrap());
        assert!(driver.list().await.unwrap().is_empty());
        assert_eq!(driver.get("old").await.unwrap(), None);
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn test_list_honours_key_query() {
        let settings = CacheSettings::builder().with_key_query("user-*").build();
        let driver = MemoryDriver::new(&settings);
        driver.set("user-1", b"a".to_vec(), None).await.unwrap();
        driver.set("order-1", b"b".to_vec(), None).await.unwrap();

        let ids: Vec<_> = driver.list().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["user-1".to_string()]);
    }

    #[tokio::test]
    async fn test_clean_keeps_live_entries() {
        let driver = driver();
        let past = Utc::now() - chrono::Duration::seconds(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        driver.set("old", b"1".to_vec(), Some(past)).await.unwrap();
        driver.set("new", b"2".to_vec(), Some(future)).await.unwrap();
        driver.set("forever", b"3".to_vec(), None).await.unwrap();

        driver.clean().await.unwrap();
        assert_eq!(driver.len(), 2);
        driver.clear().await.unwrap();
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn test_lock_cycle() {
        let driver = driver();
        assert!(driver.lock_acquire("x", vec![], None).await.unwrap());
        assert!(!driver.lock_acquire("x", vec![], None).await.unwrap());
        assert!(driver.lock_hydrate("x", b"2".to_vec(), None).await.unwrap());
        assert_eq!(driver.get("x").await.unwrap(), Some(b"2".to_vec()));
        assert!(driver.lock_release("x").await.unwrap());
        assert!(!driver.lock_release("x").await.unwrap());
        assert!(!driver.lock_exists("x").await.unwrap());
        assert!(!driver.lock_hydrate("x", vec![], None).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_counts_as_absent() {
        let driver = driver();
        let past = Utc::now() - chrono::Duration::seconds(1);
        driver.set("x", vec![], Some(past)).await.unwrap();
        assert!(driver.lock_acquire("x", vec![], None).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_grants_once() {
        let driver = Arc::new(driver());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let driver = Arc::clone(&driver);
            handles.push(tokio::spawn(async move {
                driver.lock_acquire("contended", vec![], None).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }
}
