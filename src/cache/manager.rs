// Image cache manager.
// Maps remote image URIs to local files with TTL expiry and size-bounded eviction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::fetch::{HttpFetcher, ImageFetcher};
use super::paths;
use super::store::{self, CacheEntry, CacheIndex};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{EgardenError, Result};

/// Snapshot of cache usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    #[serde(rename = "totalItems")]
    pub total_items: usize,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "totalSizeMB")]
    pub total_size_mb: f64,
    #[serde(rename = "maxSizeMB")]
    pub max_size_mb: f64,
}

/// Local image cache.
///
/// Without a persistent filesystem the manager runs in pass-through mode:
/// lookups return their input and every other operation does nothing.
pub struct ImageCacheManager {
    disk: Option<DiskCache>,
    max_size_mb: f64,
}

struct DiskCache {
    dir: PathBuf,
    config: CacheConfig,
    fetcher: Arc<dyn ImageFetcher>,
    clock: Arc<dyn Clock>,
    index: Mutex<CacheIndex>,
    initialized: OnceCell<()>,
    /// Serializes index snapshots so the newest one lands last.
    persist_lock: tokio::sync::Mutex<()>,
    /// One lock per URI key currently being looked up or fetched.
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageCacheManager {
    /// Create a manager that fetches over HTTP and uses the wall clock.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new()?;
        Ok(Self::with_parts(
            config,
            Arc::new(fetcher),
            Arc::new(SystemClock),
        ))
    }

    /// Create a manager with an explicit fetcher and clock.
    pub fn with_parts(
        config: CacheConfig,
        fetcher: Arc<dyn ImageFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max_size_mb = config.max_mb();
        let disk = config.cache_dir.clone().map(|dir| DiskCache {
            dir,
            config,
            fetcher,
            clock,
            index: Mutex::new(CacheIndex::new()),
            initialized: OnceCell::new(),
            persist_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashMap::new()),
        });

        if disk.is_none() {
            info!("No persistent cache directory available, image cache is pass-through");
        }

        Self { disk, max_size_mb }
    }

    /// Create a manager for targets without a persistent filesystem.
    pub fn pass_through() -> Self {
        Self {
            disk: None,
            max_size_mb: CacheConfig::default().max_mb(),
        }
    }

    /// Whether this manager caches nothing.
    pub fn is_pass_through(&self) -> bool {
        self.disk.is_none()
    }

    /// Cache directory, if any.
    pub fn cache_dir(&self) -> Option<&std::path::Path> {
        self.disk.as_ref().map(|d| d.dir.as_path())
    }

    /// Create the cache directory, load the index, and drop expired entries.
    /// Only the first successful call does any work.
    pub async fn initialize(&self) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.initialize().await,
            None => Ok(()),
        }
    }

    /// Return a local path for `uri`, fetching it on a miss.
    ///
    /// Any failure along the way yields `uri` itself, so the result is only a
    /// best-effort local reference.
    pub async fn get_cached_image(&self, uri: &str) -> String {
        let Some(disk) = &self.disk else {
            return uri.to_string();
        };

        if let Err(e) = disk.initialize().await {
            warn!(error = %e, "Image cache unavailable, serving remote URI");
            return uri.to_string();
        }

        let key = paths::cache_key(uri);
        let slot = disk.acquire_slot(&key);
        let result = {
            let _guard = slot.lock().await;
            disk.lookup_or_fetch(&key, uri).await
        };
        disk.release_slot(&key, slot);

        result
    }

    /// Delete every cached image and reset the index.
    pub async fn clear_cache(&self) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.clear().await,
            None => Ok(()),
        }
    }

    /// Current usage. Does not touch the filesystem.
    pub fn get_cache_stats(&self) -> CacheStats {
        let (total_items, total_size) = match &self.disk {
            Some(disk) => {
                let index = disk.lock_index();
                (index.len(), index.total_bytes())
            }
            None => (0, 0),
        };

        CacheStats {
            total_items,
            total_size,
            total_size_mb: round_mb(total_size),
            max_size_mb: self.max_size_mb,
        }
    }

    /// Drop every entry older than the TTL.
    pub async fn sweep_expired(&self) -> usize {
        match &self.disk {
            Some(disk) => disk.sweep_expired().await,
            None => 0,
        }
    }
}

impl std::fmt::Debug for ImageCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCacheManager")
            .field("cache_dir", &self.cache_dir())
            .field("max_size_mb", &self.max_size_mb)
            .finish()
    }
}

impl DiskCache {
    fn lock_index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn index_path(&self) -> PathBuf {
        paths::index_path(&self.dir)
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.dir).await?;

                let index = match store::read_index(&self.index_path()).await {
                    Ok(index) => index,
                    Err(e) => {
                        warn!(error = %e, "Unreadable image cache index, starting empty");
                        CacheIndex::new()
                    }
                };
                debug!(entries = index.len(), dir = %self.dir.display(), "Loaded image cache index");
                *self.lock_index() = index;

                self.sweep_expired().await;
                Ok::<(), EgardenError>(())
            })
            .await?;

        Ok(())
    }

    fn acquire_slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.entry(key.to_string()).or_default().clone()
    }

    fn release_slot(&self, key: &str, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only handed out under this lock: two references means ours and the map's.
        if Arc::strong_count(&slot) <= 2 {
            in_flight.remove(key);
        }
    }

    async fn lookup_or_fetch(&self, key: &str, uri: &str) -> String {
        if let Some(path) = self.lookup(key).await {
            debug!(uri, "Image cache hit");
            return path;
        }

        debug!(uri, "Image cache miss");
        match self.fetch_and_store(key, uri).await {
            Ok(path) => path,
            Err(e) => {
                warn!(uri, error = %e, "Failed to cache image, serving remote URI");
                uri.to_string()
            }
        }
    }

    /// Return the local path for a fresh entry whose file exists.
    /// Stale entries and entries with missing files are removed.
    async fn lookup(&self, key: &str) -> Option<String> {
        let entry = self.lock_index().get(key).cloned()?;
        let path = entry.local_path(&self.dir);

        let fresh = !entry.is_expired(self.config.ttl, self.clock.now());
        if fresh && store::exists(&path).await {
            return Some(path.to_string_lossy().into_owned());
        }

        self.lock_index().remove(key);
        self.delete_file(&entry).await;
        self.persist().await;
        None
    }

    async fn fetch_and_store(&self, key: &str, uri: &str) -> Result<String> {
        let bytes = self.fetcher.fetch(uri).await?;

        let file = paths::image_file_name(key, uri);
        let path = self.dir.join(&file);
        store::write_atomic(&path, &bytes).await?;

        let entry = CacheEntry::new(key, uri, file, self.clock.now(), bytes.len() as u64);
        self.lock_index().insert(entry);
        info!(uri, size = bytes.len(), "Cached image");
        self.persist().await;

        let evicted = self.evict_to_fit().await;
        if evicted.iter().any(|k| k == key) {
            return Err(EgardenError::Other(format!(
                "image of {} bytes exceeds the cache cap",
                bytes.len()
            )));
        }

        Ok(path.to_string_lossy().into_owned())
    }

    /// Remove the oldest entries, a batch at a time, until the cache fits its cap.
    async fn evict_to_fit(&self) -> Vec<String> {
        let mut removed = Vec::new();

        loop {
            let batch = {
                let mut index = self.lock_index();
                if index.total_bytes() <= self.config.max_bytes {
                    break;
                }
                index.take_oldest(self.config.evict_percent)
            };
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                self.delete_file(&entry).await;
                removed.push(entry.key);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Evicted cached images over size cap");
            self.persist().await;
        }

        removed
    }

    async fn sweep_expired(&self) -> usize {
        let expired = self
            .lock_index()
            .take_expired(self.config.ttl, self.clock.now());
        if expired.is_empty() {
            return 0;
        }

        for entry in &expired {
            self.delete_file(entry).await;
        }

        info!(count = expired.len(), "Expired cached images");
        self.persist().await;
        expired.len()
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;

        store::delete_dir(&self.dir).await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        self.lock_index().clear();
        store::write_index(&self.index_path(), &CacheIndex::new()).await?;

        info!(dir = %self.dir.display(), "Cleared image cache");
        Ok(())
    }

    async fn delete_file(&self, entry: &CacheEntry) {
        if let Err(e) = store::delete(&entry.local_path(&self.dir)).await {
            warn!(file = %entry.file, error = %e, "Failed to delete cached image");
        }
    }

    /// Write the current index. Failures leave a stale snapshot behind.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.lock_index().clone();

        if let Err(e) = store::write_index(&self.index_path(), &snapshot).await {
            warn!(error = %e, "Failed to persist image cache index");
        }
    }
}

fn round_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}
