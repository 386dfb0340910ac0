//! One-file-per-entry driver
//!
//! Each entry is a small JSON envelope (`key`, `created`, `expiry`, base64
//! `value`) stored as `<sha256(key)>.cache.json` under the configured
//! directory, so file names stay short whatever the key length. Writes go
//! through a uniquely named swap file that is renamed over the target, so
//! readers never see a partial entry. Lock acquisition hard-links a fully
//! written swap file into place, which fails if the target already exists.
//!
//! `clean` and `clear` are not implemented natively; the dispatcher
//! synthesizes them from `list` + `unset`. Listing removes expired files it
//! comes across.
//!
//! Expired files are removed by renaming them to a private tomb first and
//! re-checking the tomb. A file that turned out to be live (rewritten since it
//! was read) is linked back instead of deleted.

use super::{is_live, key_matcher, Driver, HasKey, ListEntry, Listable, Lockable, Sizeable};
use crate::config::CacheSettings;
use crate::errors::{CacheError, Result};
use crate::hashing::hash_bytes;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const FILE_SUFFIX: &str = ".cache.json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    created: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
    value: String,
}

impl Envelope {
    fn new(key: &str, value: &[u8], expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.to_string(),
            created: Utc::now(),
            expiry,
            value: BASE64.encode(value),
        }
    }
}

/// Driver storing entries as files in a directory
#[derive(Debug)]
pub struct FilesystemDriver {
    root: PathBuf,
    key_query: String,
    /// Serializes expired-file removal within this process
    evicting: Mutex<()>,
}

impl FilesystemDriver {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            root: settings.drivers.filesystem.path.clone(),
            key_query: settings.key_query.clone(),
            evicting: Mutex::new(()),
        }
    }

    /// Directory holding the entry files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File an entry for `key` lives in
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}{FILE_SUFFIX}", hash_bytes(key.as_bytes())))
    }

    fn swap_path(&self) -> PathBuf {
        self.root.join(format!(".{}.swap", uuid::Uuid::new_v4()))
    }

    fn tomb_path(&self) -> PathBuf {
        self.root.join(format!(".{}.tomb", uuid::Uuid::new_v4()))
    }

    /// Read an envelope without judging its expiry
    async fn load(&self, key: &str, path: &Path) -> Result<Option<Envelope>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::file_system(path, "read cache entry", e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::decode_file(key, path, e.to_string()))
    }

    /// Read a live envelope, deleting the file if it has expired
    async fn load_live(&self, key: &str) -> Result<Option<Envelope>> {
        let path = self.entry_path(key);
        match self.load(key, &path).await? {
            Some(envelope) if is_live(envelope.expiry, Utc::now()) => Ok(Some(envelope)),
            Some(_) => {
                self.remove_if_expired(key, &path).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Remove `path` only if the file there is still expired
    ///
    /// Returns true when an expired file was removed.
    async fn remove_if_expired(&self, key: &str, path: &Path) -> Result<bool> {
        let _evicting = self.evicting.lock().await;
        match self.load(key, path).await {
            Ok(Some(envelope)) if is_live(envelope.expiry, Utc::now()) => return Ok(false),
            Ok(None) => return Ok(false),
            _ => {}
        }

        let tomb = self.tomb_path();
        match fs::rename(path, &tomb).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::file_system(path, "move expired cache entry", e)),
        }

        let expired = match self.load(key, &tomb).await {
            Ok(Some(envelope)) => !is_live(envelope.expiry, Utc::now()),
            Ok(None) => false,
            // Unreadable records were already going to be replaced
            Err(_) => true,
        };
        if !expired {
            // A fresh write landed between the read and the rename; put it back
            // unless something newer already took its place
            if let Err(e) = self.link_exclusive(&tomb, path).await {
                warn!(key, error = %e, "failed to restore live cache entry");
            }
        } else {
            debug!(key, path = %path.display(), "removed expired cache file");
        }
        remove_if_present(&tomb).await?;
        Ok(expired)
    }

    /// Write the envelope to a fresh swap file and return its path
    async fn write_swap(&self, envelope: &Envelope) -> Result<PathBuf> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| CacheError::encode(&envelope.key, e.to_string()))?;
        let swap = self.swap_path();

        let result = async {
            let mut file = fs::File::create(&swap)
                .await
                .map_err(|e| CacheError::file_system(&swap, "create swap file", e))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| CacheError::file_system(&swap, "write swap file", e))?;
            file.sync_all()
                .await
                .map_err(|e| CacheError::file_system(&swap, "sync swap file", e))?;
            Ok::<(), CacheError>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&swap).await;
            return Err(e);
        }
        Ok(swap)
    }

    async fn write_atomic(&self, envelope: &Envelope) -> Result<()> {
        let path = self.entry_path(&envelope.key);
        let swap = self.write_swap(envelope).await?;
        if let Err(e) = fs::rename(&swap, &path).await {
            let _ = fs::remove_file(&swap).await;
            return Err(CacheError::file_system(&path, "atomic rename", e));
        }
        Ok(())
    }

    /// Hard-link a swap file into place; false if the target already exists
    async fn link_exclusive(&self, swap: &Path, path: &Path) -> Result<bool> {
        match fs::hard_link(swap, path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CacheError::file_system(path, "link lock file", e)),
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::file_system(path, "remove cache entry", e)),
    }
}

#[async_trait]
impl Driver for FilesystemDriver {
    fn id(&self) -> &str {
        "filesystem"
    }

    async fn can_load(&self) -> Result<bool> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::file_system(&self.root, "create cache directory", e))?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match self.load_live(key).await? {
            Some(envelope) => BASE64
                .decode(envelope.value.as_bytes())
                .map(Some)
                .map_err(|e| CacheError::decode_file(key, path, e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()> {
        self.write_atomic(&Envelope::new(key, &value, expiry)).await
    }

    async fn unset(&self, key: &str) -> Result<()> {
        remove_if_present(&self.entry_path(key)).await?;
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

    fn as_lockable(&self) -> Option<&dyn Lockable> {
        Some(self)
    }
}

#[async_trait]
impl HasKey for FilesystemDriver {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.load_live(key).await?.is_some())
    }
}

#[async_trait]
impl Sizeable for FilesystemDriver {
    async fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.get(key).await?.map(|value| value.len() as u64))
    }
}

#[async_trait]
impl Listable for FilesystemDriver {
    async fn list(&self) -> Result<Vec<ListEntry>> {
        let matcher = key_matcher(&self.key_query)?;
        let now = Utc::now();
        let mut entries = Vec::new();

        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(CacheError::file_system(&self.root, "read cache directory", e)),
        };

        loop {
            let item = match dir.next_entry().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    return Err(CacheError::file_system(&self.root, "read cache directory", e))
                }
            };

            let name = item.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(FILE_SUFFIX)) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }

            // File names are hashes, the key itself lives in the envelope
            let path = item.path();
            match self.load(stem, &path).await {
                Ok(Some(envelope)) if !matcher.is_match(&envelope.key) => {}
                Ok(Some(envelope)) if is_live(envelope.expiry, now) => entries.push(ListEntry {
                    id: envelope.key,
                    expiry: envelope.expiry,
                    created: Some(envelope.created),
                }),
                // Expired files are removed while scanning, which is also how clean() works here
                Ok(Some(envelope)) => {
                    self.remove_if_expired(&envelope.key, &path).await?;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "skipping unreadable cache file"),
            }
        }

        Ok(entries)
    }
}

#[async_trait]
impl Lockable for FilesystemDriver {
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let path = self.entry_path(key);
        let swap = self.write_swap(&Envelope::new(key, &value, expiry)).await?;

        let mut acquired = self.link_exclusive(&swap, &path).await;
        if matches!(acquired, Ok(false)) {
            acquired = match self.load_live(key).await {
                // The holder had expired and was removed, or was released meanwhile
                Ok(None) => self.link_exclusive(&swap, &path).await,
                Ok(Some(_)) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let _ = fs::remove_file(&swap).await;
        acquired
    }

    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if self.load_live(key).await?.is_none() {
            return Ok(false);
        }
        self.write_atomic(&Envelope::new(key, &value, expiry)).await?;
        Ok(true)
    }

    async fn lock_release(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key);
        let live = match self.load(key, &path).await {
            Ok(Some(envelope)) => is_live(envelope.expiry, Utc::now()),
            Ok(None) => false,
            // A corrupt record still blocks acquisition, so removing it counts
            Err(_) => true,
        };
        Ok(remove_if_present(&path).await? && live)
    }

    async fn lock_exists(&self, key: &str) -> Result<bool> {
        Ok(self.load_live(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver(dir: &TempDir) -> FilesystemDriver {
        let settings = CacheSettings::builder()
            .with_filesystem_path(dir.path())
            .build();
        FilesystemDriver::new(&settings)
    }

    #[tokio::test]
    async fn test_round_trip_and_unset() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        assert!(driver.can_load().await.unwrap());

        driver.set("foo", b"Foo".to_vec(), None).await.unwrap();
        assert!(driver.entry_path("foo").exists());
        assert_eq!(driver.get("foo").await.unwrap(), Some(b"Foo".to_vec()));
        assert_eq!(driver.size("foo").await.unwrap(), Some(3));

        driver.unset("foo").await.unwrap();
        driver.unset("foo").await.unwrap();
        assert_eq!(driver.get("foo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_can_load_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let settings = CacheSettings::builder().with_filesystem_path(&nested).build();
        let driver = FilesystemDriver::new(&settings);
        assert!(driver.can_load().await.unwrap());
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_expired_file_is_removed_on_read() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        let past = Utc::now() - chrono::Duration::seconds(1);
        driver.set("old", b"1".to_vec(), Some(past)).await.unwrap();

        assert!(!driver.has("old").await.unwrap());
        assert!(!driver.entry_path("old").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_names_path() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        let path = driver.entry_path("badjson");
        std::fs::write(&path, "this is bad JSON content").unwrap();

        let err = driver.get("badjson").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("badjson"));
        assert!(message.contains(&path.display().to_string()));
    }

    #[tokio::test]
    async fn test_list_skips_swap_files_and_expired() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        let past = Utc::now() - chrono::Duration::seconds(1);
        driver.set("a", b"1".to_vec(), None).await.unwrap();
        driver.set("b", b"2".to_vec(), Some(past)).await.unwrap();
        std::fs::write(dir.path().join(".stray.swap"), "{}").unwrap();

        let ids: Vec<_> = driver.list().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_cycle() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);

        assert!(driver.lock_acquire("x", b"1".to_vec(), None).await.unwrap());
        assert!(!driver.lock_acquire("x", b"2".to_vec(), None).await.unwrap());
        assert_eq!(driver.get("x").await.unwrap(), Some(b"1".to_vec()));
        assert!(driver.lock_hydrate("x", b"3".to_vec(), None).await.unwrap());
        assert_eq!(driver.get("x").await.unwrap(), Some(b"3".to_vec()));
        assert!(driver.lock_release("x").await.unwrap());
        assert!(!driver.lock_exists("x").await.unwrap());
        assert!(!driver.lock_release("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        let past = Utc::now() - chrono::Duration::seconds(1);
        driver.set("x", vec![], Some(past)).await.unwrap();
        assert!(driver.lock_acquire("x", vec![], None).await.unwrap());
        assert!(driver.lock_exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_long_keys_fit_in_file_names() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        let key = format!("tenant/{}", "k".repeat(300));

        driver.set(&key, b"v".to_vec(), None).await.unwrap();
        assert_eq!(driver.get(&key).await.unwrap(), Some(b"v".to_vec()));
        assert!(driver.lock_acquire(&format!("{key}-lock"), vec![], None).await.unwrap());

        let mut ids: Vec<_> = driver.list().await.unwrap().into_iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec![key.clone(), format!("{key}-lock")]);
    }

    #[tokio::test]
    async fn test_rewritten_entry_survives_expired_removal() {
        let dir = TempDir::new().unwrap();
        let driver = driver(&dir);
        let past = Utc::now() - chrono::Duration::seconds(1);
        driver.set("x", b"old".to_vec(), Some(past)).await.unwrap();
        let path = driver.entry_path("x");

        // A reader saw the stale record, then a writer replaced it
        driver.set("x", b"new".to_vec(), None).await.unwrap();
        assert!(!driver.remove_if_expired("x", &path).await.unwrap());
        assert_eq!(driver.get("x").await.unwrap(), Some(b"new".to_vec()));

        driver.set("x", b"old".to_vec(), Some(past)).await.unwrap();
        assert!(driver.remove_if_expired("x", &path).await.unwrap());
        assert!(!path.exists());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_lock_is_taken_over_once() {
        let dir = TempDir::new().unwrap();
        let driver = std::sync::Arc::new(driver(&dir));
        let past = Utc::now() - chrono::Duration::seconds(1);

        for round in 0..10 {
            driver.set("job", vec![], Some(past)).await.unwrap();
            let attempts = (0..16).map(|i| {
                let driver = std::sync::Arc::clone(&driver);
                tokio::spawn(async move {
                    driver.lock_acquire("job", vec![i], None).await.unwrap()
                })
            });
            let granted = futures::future::join_all(attempts)
                .await
                .into_iter()
                .filter(|joined| *joined.as_ref().unwrap())
                .count();
            assert_eq!(granted, 1, "round {round}");
            assert!(driver.lock_release("job").await.unwrap());
        }
    }
}
