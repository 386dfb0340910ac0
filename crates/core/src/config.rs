//! Cache settings and builder
//!
//! Plain-data driver settings derive serde so an embedding application can
//! load them from whatever configuration format it already uses. Behavioural
//! settings (key mangling, codec, extra drivers) are set through the builder.

use crate::codec::{Codec, JsonCodec};
use crate::drivers::{DriverFactory, DriverRegistry};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Function applied to every key before it reaches a driver
pub type KeyMangle = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Default auto-clean interval
pub const DEFAULT_CLEAN_AUTO_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default ceiling for draining in-flight writes on destroy
pub const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for the in-process memory driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Remove expired entries as soon as a read notices them
    pub evict_on_read: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            evict_on_read: true,
        }
    }
}

/// Settings for the filesystem driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemSettings {
    /// Directory holding one file per entry
    pub path: PathBuf,
}

impl Default for FilesystemSettings {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("polycache"),
        }
    }
}

/// Settings for the Redis driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,
    /// How long `can_load` waits for a connection
    pub connect_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_ms: 2000,
        }
    }
}

/// Settings for the Supabase (PostgREST) driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseSettings {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: Option<String>,
    /// Service or anon API key
    pub api_key: Option<String>,
    pub table: String,
    pub col_id: String,
    pub col_created: String,
    pub col_expires: String,
    pub col_data: String,
}

impl Default for SupabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            table: "cache".to_string(),
            col_id: "id".to_string(),
            col_created: "created_at".to_string(),
            col_expires: "expires_at".to_string(),
            col_data: "data".to_string(),
        }
    }
}

/// Settings for the MongoDB driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongodbSettings {
    /// Connection string, e.g. `mongodb://localhost:27017`
    pub uri: String,
    /// Used when the connection string names no default database
    pub database: String,
    pub collection: String,
    pub connect_timeout_ms: u64,
}

impl Default for MongodbSettings {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "polycache".to_string(),
            collection: "polycache".to_string(),
            connect_timeout_ms: 2000,
        }
    }
}

/// Settings for the Memcached driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcachedSettings {
    /// Server URL, e.g. `memcache://127.0.0.1:11211`
    pub url: String,
    pub connect_timeout_ms: u64,
}

impl Default for MemcachedSettings {
    fn default() -> Self {
        Self {
            url: "memcache://127.0.0.1:11211".to_string(),
            connect_timeout_ms: 2000,
        }
    }
}

/// Per-driver settings, namespaced by driver id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub memory: MemorySettings,
    pub filesystem: FilesystemSettings,
    pub redis: RedisSettings,
    pub supabase: SupabaseSettings,
    pub mongodb: MongodbSettings,
    pub memcached: MemcachedSettings,
}

/// Complete settings for a [`crate::Cache`]
#[derive(Clone)]
pub struct CacheSettings {
    /// Candidate driver ids, probed in order
    pub modules: Vec<String>,
    pub key_mangle: Option<KeyMangle>,
    /// Glob handed to drivers that filter `list()`
    pub key_query: String,
    pub codec: Arc<dyn Codec>,
    /// Run `init()` when the cache is opened
    pub init: bool,
    /// Run one `clean()` right after a driver is bound
    pub clean_init: bool,
    /// Start the auto-clean timer right after a driver is bound
    pub clean_auto: bool,
    pub clean_auto_interval: Duration,
    /// Ceiling for draining in-flight writes during `destroy()`, `None` waits forever
    pub destroy_timeout: Option<Duration>,
    pub drivers: DriverSettings,
    pub registry: DriverRegistry,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            modules: vec!["memory".to_string()],
            key_mangle: None,
            key_query: "*".to_string(),
            codec: Arc::new(JsonCodec),
            init: true,
            clean_init: false,
            clean_auto: false,
            clean_auto_interval: DEFAULT_CLEAN_AUTO_INTERVAL,
            destroy_timeout: Some(DEFAULT_DESTROY_TIMEOUT),
            drivers: DriverSettings::default(),
            registry: DriverRegistry::with_builtin(),
        }
    }
}

impl std::fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSettings")
            .field("modules", &self.modules)
            .field("key_mangle", &self.key_mangle.is_some())
            .field("key_query", &self.key_query)
            .field("codec", &self.codec.name())
            .field("init", &self.init)
            .field("clean_init", &self.clean_init)
            .field("clean_auto", &self.clean_auto)
            .field("clean_auto_interval", &self.clean_auto_interval)
            .field("destroy_timeout", &self.destroy_timeout)
            .field("drivers", &self.drivers)
            .field("registry", &self.registry)
            .finish()
    }
}

impl CacheSettings {
    /// Start building settings from the defaults
    pub fn builder() -> CacheSettingsBuilder {
        CacheSettingsBuilder::new()
    }

    /// Apply the configured key mangle
    pub fn mangle(&self, key: &str) -> String {
        match &self.key_mangle {
            Some(mangle) => mangle(key),
            None => key.to_string(),
        }
    }
}

/// Builder for [`CacheSettings`]
#[derive(Debug, Default)]
pub struct CacheSettingsBuilder {
    settings: CacheSettings,
}

impl CacheSettingsBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            settings: CacheSettings::default(),
        }
    }

    /// Replace the candidate driver list
    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Use a single driver
    pub fn with_module(self, module: impl Into<String>) -> Self {
        self.with_modules([module.into()])
    }

    pub fn with_key_mangle<F>(mut self, mangle: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.settings.key_mangle = Some(Arc::new(mangle));
        self
    }

    pub fn with_key_query(mut self, query: impl Into<String>) -> Self {
        self.settings.key_query = query.into();
        self
    }

    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.settings.codec = Arc::new(codec);
        self
    }

    pub fn with_init(mut self, init: bool) -> Self {
        self.settings.init = init;
        self
    }

    pub fn with_clean_init(mut self, clean_init: bool) -> Self {
        self.settings.clean_init = clean_init;
        self
    }

    pub fn with_clean_auto(mut self, clean_auto: bool) -> Self {
        self.settings.clean_auto = clean_auto;
        self
    }

    pub fn with_clean_auto_interval(mut self, interval: Duration) -> Self {
        self.settings.clean_auto_interval = interval;
        self
    }

    pub fn with_destroy_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.destroy_timeout = timeout;
        self
    }

    /// Replace every driver's settings at once
    pub fn with_drivers(mut self, drivers: DriverSettings) -> Self {
        self.settings.drivers = drivers;
        self
    }

    pub fn with_memory(mut self, memory: MemorySettings) -> Self {
        self.settings.drivers.memory = memory;
        self
    }

    pub fn with_filesystem(mut self, filesystem: FilesystemSettings) -> Self {
        self.settings.drivers.filesystem = filesystem;
        self
    }

    /// Shorthand for a filesystem driver rooted at `path`
    pub fn with_filesystem_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.drivers.filesystem.path = path.into();
        self
    }

    pub fn with_redis(mut self, redis: RedisSettings) -> Self {
        self.settings.drivers.redis = redis;
        self
    }

    pub fn with_supabase(mut self, supabase: SupabaseSettings) -> Self {
        self.settings.drivers.supabase = supabase;
        self
    }

    pub fn with_mongodb(mut self, mongodb: MongodbSettings) -> Self {
        self.settings.drivers.mongodb = mongodb;
        self
    }

    pub fn with_memcached(mut self, memcached: MemcachedSettings) -> Self {
        self.settings.drivers.memcached = memcached;
        self
    }

    /// Register an additional driver factory under `id`
    pub fn with_driver(mut self, id: impl Into<String>, factory: DriverFactory) -> Self {
        self.settings.registry.register(id, factory);
        self
    }

    pub fn build(self) -> CacheSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert_eq!(settings.modules, vec!["memory".to_string()]);
        assert_eq!(settings.key_query, "*");
        assert_eq!(settings.codec.name(), "json");
        assert_eq!(settings.clean_auto_interval, Duration::from_secs(3600));
        assert_eq!(settings.destroy_timeout, Some(Duration::from_secs(60)));
        assert!(settings.registry.contains("memory"));
        assert!(settings.registry.contains("filesystem"));
    }

    #[test]
    fn test_builder_and_mangle() {
        let settings = CacheSettings::builder()
            .with_modules(["redis", "memory"])
            .with_key_mangle(|key| format!("app-{key}"))
            .with_clean_auto(true)
            .with_clean_auto_interval(Duration::from_secs(5))
            .build();

        assert_eq!(settings.modules, vec!["redis", "memory"]);
        assert_eq!(settings.mangle("foo"), "app-foo");
        assert!(settings.clean_auto);
        assert_eq!(settings.clean_auto_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_driver_settings_deserialize_with_defaults() {
        let drivers: DriverSettings = serde_json::from_str(
            r#"{"filesystem": {"path": "/var/cache/app"}, "supabase": {"url": "https://x.supabase.co", "table": "kv"}}"#,
        )
        .unwrap();

        assert_eq!(drivers.filesystem.path, PathBuf::from("/var/cache/app"));
        assert_eq!(drivers.supabase.url.as_deref(), Some("https://x.supabase.co"));
        assert_eq!(drivers.supabase.table, "kv");
        assert_eq!(drivers.supabase.col_data, "data");
        assert_eq!(drivers.redis, RedisSettings::default());
    }

    #[test]
    fn test_mongodb_and_memcached_settings() {
        let drivers: DriverSettings = serde_json::from_str(
            r#"{"mongodb": {"uri": "mongodb://db:27017/app"}, "memcached": {"url": "memcache://mc:11211"}}"#,
        )
        .unwrap();

        assert_eq!(drivers.mongodb.uri, "mongodb://db:27017/app");
        assert_eq!(drivers.mongodb.collection, "polycache");
        assert_eq!(drivers.memcached.url, "memcache://mc:11211");
        assert_eq!(drivers.memcached.connect_timeout_ms, 2000);
    }
}
