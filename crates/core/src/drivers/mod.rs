//! Storage driver adapter contract
//!
//! A driver must implement [`Driver`]: availability probing plus
//! `get`/`set`/`unset` over opaque bytes. Everything else is optional and
//! exposed through the `as_*` accessors, which return `None` unless the
//! driver implements the matching capability trait. The capability set of a
//! bound driver is computed once with [`Capabilities::of`].

use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod filesystem;
#[cfg(feature = "memcached")]
pub mod memcached;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "redis")]
pub mod redis;
mod registry;
#[cfg(feature = "supabase")]
pub mod supabase;

pub use filesystem::FilesystemDriver;
#[cfg(feature = "memcached")]
pub use self::memcached::MemcachedDriver;
pub use memory::MemoryDriver;
#[cfg(feature = "mongodb")]
pub use self::mongodb::MongodbDriver;
#[cfg(feature = "redis")]
pub use self::redis::RedisDriver;
pub use registry::{DriverFactory, DriverRegistry};
#[cfg(feature = "supabase")]
pub use supabase::SupabaseDriver;

/// One item of a driver listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Backend key, after mangling
    pub id: String,
    pub expiry: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl ListEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expiry: None,
            created: None,
        }
    }

    /// Whether the entry carries an expiry strictly before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry < now)
    }
}

/// Whether an entry with this expiry is still live at `now`
pub(crate) fn is_live(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiry {
        Some(expiry) => now < expiry,
        None => true,
    }
}

/// Compile the configured key query glob
pub(crate) fn key_matcher(query: &str) -> Result<globset::GlobMatcher> {
    globset::Glob::new(query)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| CacheError::configuration(format!("invalid key query '{query}': {e}")))
}

/// Required driver operations
#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    /// Registry id of this driver, e.g. `"memory"`
    fn id(&self) -> &str;

    /// Probe whether the backend is usable without touching cache contents
    ///
    /// `Ok(false)` and `Err(_)` both mean "skip this driver".
    async fn can_load(&self) -> Result<bool>;

    /// Read a live entry, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an entry, replacing any existing one
    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()>;

    /// Delete an entry; deleting a missing key is not an error
    async fn unset(&self, key: &str) -> Result<()>;

    fn as_has(&self) -> Option<&dyn HasKey> {
        None
    }

    fn as_sizeable(&self) -> Option<&dyn Sizeable> {
        None
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        None
    }

    fn as_cleanable(&self) -> Option<&dyn Cleanable> {
        None
    }

    fn as_clearable(&self) -> Option<&dyn Clearable> {
        None
    }

    fn as_destroyable(&self) -> Option<&dyn Destroyable> {
        None
    }

    fn as_lockable(&self) -> Option<&dyn Lockable> {
        None
    }
}

/// Native existence check
#[async_trait]
pub trait HasKey: Send + Sync {
    async fn has(&self, key: &str) -> Result<bool>;
}

/// Stored size of an entry in bytes
#[async_trait]
pub trait Sizeable: Send + Sync {
    async fn size(&self, key: &str) -> Result<Option<u64>>;
}

/// Enumerate live entries matching the configured key query
#[async_trait]
pub trait Listable: Send + Sync {
    async fn list(&self) -> Result<Vec<ListEntry>>;
}

/// Drop expired entries
#[async_trait]
pub trait Cleanable: Send + Sync {
    async fn clean(&self) -> Result<()>;
}

/// Drop every entry
#[async_trait]
pub trait Clearable: Send + Sync {
    async fn clear(&self) -> Result<()>;
}

/// Release backend resources
#[async_trait]
pub trait Destroyable: Send + Sync {
    async fn destroy(&self) -> Result<()>;
}

/// Atomic conditional writes used by the locking primitive
///
/// Lock records share the keyspace of ordinary entries, so `Driver::get`
/// reads back the stored owner data.
#[async_trait]
pub trait Lockable: Send + Sync {
    /// Write only if no live record exists; true iff the write happened
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Write only if a live record exists; true iff the write happened
    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Delete the record; true iff a record was removed
    async fn lock_release(&self, key: &str) -> Result<bool>;

    async fn lock_exists(&self, key: &str) -> Result<bool>;
}

/// A single driver operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Get,
    Set,
    Unset,
    Has,
    Size,
    List,
    Clean,
    Clear,
    Destroy,
    Lock,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Get,
        Capability::Set,
        Capability::Unset,
        Capability::Has,
        Capability::Size,
        Capability::List,
        Capability::Clean,
        Capability::Clear,
        Capability::Destroy,
        Capability::Lock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Get => "get",
            Capability::Set => "set",
            Capability::Unset => "unset",
            Capability::Has => "has",
            Capability::Size => "size",
            Capability::List => "list",
            Capability::Clean => "clean",
            Capability::Clear => "clear",
            Capability::Destroy => "destroy",
            Capability::Lock => "lock",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Operations a bound driver implements natively
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u16 {
        const GET = 1 << 0;
        const SET = 1 << 1;
        const UNSET = 1 << 2;
        const HAS = 1 << 3;
        const SIZE = 1 << 4;
        const LIST = 1 << 5;
        const CLEAN = 1 << 6;
        const CLEAR = 1 << 7;
        const DESTROY = 1 << 8;
        const LOCK = 1 << 9;
    }
}

impl From<Capability> for Capabilities {
    fn from(capability: Capability) -> Self {
        match capability {
            Capability::Get => Capabilities::GET,
            Capability::Set => Capabilities::SET,
            Capability::Unset => Capabilities::UNSET,
            Capability::Has => Capabilities::HAS,
            Capability::Size => Capabilities::SIZE,
            Capability::List => Capabilities::LIST,
            Capability::Clean => Capabilities::CLEAN,
            Capability::Clear => Capabilities::CLEAR,
            Capability::Destroy => Capabilities::DESTROY,
            Capability::Lock => Capabilities::LOCK,
        }
    }
}

impl Capabilities {
    /// Inspect a driver's accessors once
    pub fn of(driver: &dyn Driver) -> Self {
        let mut caps = Capabilities::GET | Capabilities::SET | Capabilities::UNSET;
        caps.set(Capabilities::HAS, driver.as_has().is_some());
        caps.set(Capabilities::SIZE, driver.as_sizeable().is_some());
        caps.set(Capabilities::LIST, driver.as_listable().is_some());
        caps.set(Capabilities::CLEAN, driver.as_cleanable().is_some());
        caps.set(Capabilities::CLEAR, driver.as_clearable().is_some());
        caps.set(Capabilities::DESTROY, driver.as_destroyable().is_some());
        caps.set(Capabilities::LOCK, driver.as_lockable().is_some());
        caps
    }

    /// Whether an operation can be served, natively or through a synthesized path
    ///
    /// `clean` and `clear` fall back to `list` + `unset`.
    pub fn can(&self, capability: Capability) -> bool {
        if self.contains(capability.into()) {
            return true;
        }
        match capability {
            Capability::Clean | Capability::Clear => {
                self.contains(Capabilities::LIST | Capabilities::UNSET)
            }
            _ => false,
        }
    }

    /// Names of the natively supported operations, for logging
    pub fn names(&self) -> Vec<&'static str> {
        Capability::ALL
            .iter()
            .filter(|cap| self.contains((**cap).into()))
            .map(Capability::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Bare;

    #[async_trait]
    impl Driver for Bare {
        fn id(&self) -> &str {
            "bare"
        }
        async fn can_load(&self) -> Result<bool> {
            Ok(true)
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Option<DateTime<Utc>>) -> Result<()> {
            Ok(())
        }
        async fn unset(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct WithList;

    #[async_trait]
    impl Driver for WithList {
        fn id(&self) -> &str {
            "with-list"
        }
        async fn can_load(&self) -> Result<bool> {
            Ok(true)
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Option<DateTime<Utc>>) -> Result<()> {
            Ok(())
        }
        async fn unset(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn as_listable(&self) -> Option<&dyn Listable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Listable for WithList {
        async fn list(&self) -> Result<Vec<ListEntry>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_bare_driver_capabilities() {
        let caps = Capabilities::of(&Bare);
        assert_eq!(caps.names(), vec!["get", "set", "unset"]);
        assert!(!caps.can(Capability::Clean));
        assert!(!caps.can(Capability::Clear));
        assert!(!caps.can(Capability::Lock));
        assert!(!caps.can(Capability::Has));
    }

    #[test]
    fn test_list_enables_synthesized_clean_and_clear() {
        let caps = Capabilities::of(&WithList);
        assert!(caps.can(Capability::List));
        assert!(caps.can(Capability::Clean));
        assert!(caps.can(Capability::Clear));
        assert!(!caps.contains(Capabilities::CLEAN));
    }

    #[test]
    fn test_list_entry_expiry() {
        let now = Utc::now();
        let mut entry = ListEntry::new("k");
        assert!(!entry.is_expired_at(now));
        entry.expiry = Some(now);
        assert!(!entry.is_expired_at(now));
        entry.expiry = Some(now - chrono::Duration::milliseconds(1));
        assert!(entry.is_expired_at(now));
    }
}
