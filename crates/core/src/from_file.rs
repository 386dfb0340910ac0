//! Read files through the cache

use crate::cache::Cache;
use crate::errors::{CacheError, Result};
use crate::events::CacheEvent;
use crate::expiry::Expiry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Cached copy of a file along with the stats it was read with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FileEntry {
    path: PathBuf,
    contents: String,
    size: u64,
    /// Modification time in milliseconds since the epoch
    modified_ms: u128,
}

impl FileEntry {
    fn matches(&self, size: u64, modified_ms: u128) -> bool {
        self.size == size && self.modified_ms == modified_ms
    }
}

impl Cache {
    /// Contents of a UTF-8 file, cached under `key`
    ///
    /// The file is re-read whenever its size or modification time differs
    /// from the cached copy. Each read publishes [`CacheEvent::FileRead`].
    pub async fn from_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        expiry: impl Into<Expiry>,
    ) -> Result<String> {
        let path = path.as_ref();
        let (cached, metadata) = tokio::join!(
            self.get::<FileEntry>(key),
            tokio::fs::metadata(path)
        );
        let metadata = metadata.map_err(|e| CacheError::file_system(path, "stat", e))?;
        let size = metadata.len();
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or_default();

        if let Some(entry) = cached? {
            if entry.matches(size, modified_ms) {
                debug!(key, path = %path.display(), "file unchanged, serving cached copy");
                return Ok(entry.contents);
            }
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::file_system(path, "read", e))?;
        debug!(key, path = %path.display(), bytes = contents.len(), "read file into cache");
        self.inner.events.publish(CacheEvent::FileRead {
            path: path.to_path_buf(),
            bytes: contents.len(),
        });

        let entry = FileEntry {
            path: path.to_path_buf(),
            contents,
            size,
            modified_ms,
        };
        self.set(key, &entry, expiry).await?;
        Ok(entry.contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use tempfile::TempDir;

    fn file_reads(rx: &mut tokio::sync::broadcast::Receiver<crate::events::EventEnvelope>) -> usize {
        let mut reads = 0;
        while let Ok(envelope) = rx.try_recv() {
            if matches!(envelope.event, CacheEvent::FileRead { .. }) {
                reads += 1;
            }
        }
        reads
    }

    #[tokio::test]
    async fn test_reads_once_until_file_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("motd.txt");
        std::fs::write(&path, "hello").unwrap();

        let cache = Cache::open(CacheSettings::default()).await.unwrap();
        let mut rx = cache.subscribe();

        assert_eq!(cache.from_file("motd", &path, Expiry::Never).await.unwrap(), "hello");
        assert_eq!(cache.from_file("motd", &path, Expiry::Never).await.unwrap(), "hello");
        assert_eq!(file_reads(&mut rx), 1);

        // Size change alone is enough even if the mtime granularity hides the edit
        std::fs::write(&path, "hello, world").unwrap();
        assert_eq!(
            cache.from_file("motd", &path, Expiry::Never).await.unwrap(),
            "hello, world"
        );
        assert_eq!(file_reads(&mut rx), 1);
    }

    #[tokio::test]
    async fn test_missing_file_names_the_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.txt");
        let cache = Cache::open(CacheSettings::default()).await.unwrap();

        let err = cache.from_file("absent", &path, Expiry::Never).await.unwrap_err();
        assert!(matches!(err, CacheError::FileSystem { .. }));
        assert!(err.to_string().contains("absent.txt"));
    }
}
