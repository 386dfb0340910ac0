//! Driver id → factory lookup used by `init()`

use super::{Driver, FilesystemDriver, MemoryDriver};
use crate::config::CacheSettings;
use crate::errors::{CacheError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Builds a driver instance from the current settings
///
/// Factories must not perform I/O; availability is checked afterwards with
/// `Driver::can_load`.
pub type DriverFactory = Arc<dyn Fn(&CacheSettings) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Registry of known drivers
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every driver compiled into this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "memory",
            Arc::new(|settings: &CacheSettings| {
                Ok(Arc::new(MemoryDriver::new(settings)) as Arc<dyn Driver>)
            }),
        );
        registry.register(
            "filesystem",
            Arc::new(|settings: &CacheSettings| {
                Ok(Arc::new(FilesystemDriver::new(settings)) as Arc<dyn Driver>)
            }),
        );
        #[cfg(feature = "redis")]
        registry.register(
            "redis",
            Arc::new(|settings: &CacheSettings| {
                Ok(Arc::new(super::RedisDriver::new(settings)?) as Arc<dyn Driver>)
            }),
        );
        #[cfg(feature = "supabase")]
        registry.register(
            "supabase",
            Arc::new(|settings: &CacheSettings| {
                Ok(Arc::new(super::SupabaseDriver::new(settings)?) as Arc<dyn Driver>)
            }),
        );
        #[cfg(feature = "mongodb")]
        registry.register(
            "mongodb",
            Arc::new(|settings: &CacheSettings| {
                Ok(Arc::new(super::MongodbDriver::new(settings)) as Arc<dyn Driver>)
            }),
        );
        #[cfg(feature = "memcached")]
        registry.register(
            "memcached",
            Arc::new(|settings: &CacheSettings| {
                Ok(Arc::new(super::MemcachedDriver::new(settings)) as Arc<dyn Driver>)
            }),
        );
        registry
    }

    /// Register or replace a driver factory
    pub fn register(&mut self, id: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(id.into(), factory);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered ids in sorted order
    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the driver registered under `id`
    pub fn create(&self, id: &str, settings: &CacheSettings) -> Result<Arc<dyn Driver>> {
        match self.factories.get(id) {
            Some(factory) => factory(settings),
            None => Err(CacheError::driver_unavailable(
                id,
                "no driver registered under this id",
            )),
        }
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.contains("memory"));
        assert!(registry.contains("filesystem"));
        assert_eq!(registry.contains("mongodb"), cfg!(feature = "mongodb"));
        assert_eq!(registry.contains("memcached"), cfg!(feature = "memcached"));
    }

    #[test]
    fn test_create_unknown_driver_fails() {
        let registry = DriverRegistry::new();
        let err = registry
            .create("couchdb", &CacheSettings::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::DriverUnavailable { ref driver, .. } if driver == "couchdb"));
    }

    #[test]
    fn test_register_replaces_factory() {
        let mut registry = DriverRegistry::with_builtin();
        registry.register(
            "memory",
            Arc::new(|_: &CacheSettings| Err(CacheError::driver_unavailable("memory", "disabled"))),
        );
        assert!(registry.create("memory", &CacheSettings::default()).is_err());
    }
}
