// Cache store for the image index and image files.
// Handles JSON serialization of the index, TTL checks, and atomic filesystem writes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::paths;
use crate::error::Result;

/// Default TTL for cached images: 7 days.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default aggregate size cap: 100 MB.
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// One cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hash of the source URI. Not persisted; it is the index map key.
    #[serde(skip)]
    pub key: String,
    /// Source URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// File name inside the cache directory. Older snapshots omit it.
    #[serde(default)]
    pub file: String,
    /// When the image was fetched.
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Size of the stored file.
    #[serde(rename = "size")]
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        uri: impl Into<String>,
        file: impl Into<String>,
        created_at: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        Self {
            key: key.into(),
            uri: Some(uri.into()),
            file: file.into(),
            created_at,
            size_bytes,
        }
    }

    /// Full path of the cached file.
    pub fn local_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file)
    }

    /// Check if this entry is older than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now
            .signed_duration_since(self.created_at)
            .to_std()
            // Entries from the future count as fresh.
            .unwrap_or(Duration::ZERO);

        elapsed > ttl
    }
}

/// In-memory mirror of `index.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Sum of all entry sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Remove and return every entry older than `ttl`.
    pub fn take_expired(&mut self, ttl: Duration, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(ttl, now))
            .map(|e| e.key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    /// Remove and return the oldest `percent` of entries (rounded up, at least one).
    pub fn take_oldest(&mut self, percent: usize) -> Vec<CacheEntry> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .entries
            .values()
            .map(|e| (e.created_at, e.key.clone()))
            .collect();
        by_age.sort();

        let count = (by_age.len() * percent).div_ceil(100).clamp(1, by_age.len());

        by_age
            .into_iter()
            .take(count)
            .filter_map(|(_, key)| self.entries.remove(&key))
            .collect()
    }
}

/// Read the index snapshot. A missing file is an empty index.
///
/// Entries without a file name get one from their URI, or from a `<key>.*` file
/// next to the index. Entries whose file is not a plain name inside the cache
/// directory are dropped.
pub async fn read_index(path: &Path) -> Result<CacheIndex> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(CacheIndex::new());
    }

    let contents = fs::read_to_string(path).await?;
    let map: HashMap<String, CacheEntry> = serde_json::from_str(&contents)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut index = CacheIndex::new();
    for (key, mut entry) in map {
        entry.key = key;

        if entry.file.is_empty() {
            let resolved = match &entry.uri {
                Some(uri) => Some(paths::image_file_name(&entry.key, uri)),
                None => find_file_for_key(dir, &entry.key).await,
            };
            match resolved {
                Some(file) => entry.file = file,
                None => {
                    warn!(key = %entry.key, "Dropping index entry with no cached file");
                    continue;
                }
            }
        }

        if !is_plain_file_name(&entry.file) {
            warn!(key = %entry.key, file = %entry.file, "Dropping index entry outside the cache directory");
            continue;
        }

        index.insert(entry);
    }

    Ok(index)
}

/// Whether `name` is a single normal path component.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == OsStr::new(name)
    )
}

async fn find_file_for_key(dir: &Path, key: &str) -> Option<String> {
    let prefix = format!("{}.", key);
    let mut entries = fs::read_dir(dir).await.ok()?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && !name.ends_with(".tmp") {
            return Some(name);
        }
    }

    None
}

/// Write the index snapshot atomically.
pub async fn write_index(path: &Path, index: &CacheIndex) -> Result<()> {
    let json = serde_json::to_string_pretty(&index.entries)?;
    write_atomic(path, json.as_bytes()).await
}

/// Write bytes via a temp file and rename, creating the parent directory.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, bytes, false).await
}

/// Like [`write_atomic`], but the file is owner-only from the moment it is created (unix).
pub async fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, bytes, true).await
}

async fn write_atomic_with(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    // Creation mode only applies to new files, so a leftover temp file must go first.
    delete(&temp_path).await?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Check if a cached file exists.
pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Delete a cached file. A file that is already gone is not an error.
pub async fn delete(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete a directory and all contents. A missing directory is not an error.
pub async fn delete_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, age_days: i64, size: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            format!("https://x/{}.jpg", key),
            format!("{}.jpg", key),
            Utc::now() - chrono::Duration::days(age_days),
            size,
        )
    }

    #[tokio::test]
    async fn test_write_and_read_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");

        let mut index = CacheIndex::new();
        index.insert(entry("a", 1, 10));
        index.insert(entry("b", 2, 20));

        write_index(&path, &index).await.unwrap();

        let read = read_index(&path).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.get("a").unwrap().size_bytes, 10);
        assert_eq!(read.get("b").unwrap().key, "b");
        assert_eq!(read.total_bytes(), 30);
    }

    #[tokio::test]
    async fn test_index_wire_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");

        let mut index = CacheIndex::new();
        index.insert(entry("abc", 0, 42));
        write_index(&path, &index).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let record = &raw["abc"];
        assert_eq!(record["size"], 42);
        assert_eq!(record["file"], "abc.jpg");
        assert!(record["timestamp"].is_i64());
        assert!(record.get("key").is_none());
    }

    #[tokio::test]
    async fn test_read_nonexistent_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nonexistent.json");

        let index = read_index(&path).await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_read_index_without_file_names() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");

        let with_uri = paths::cache_key("https://x/a.png");
        let without_uri = paths::cache_key("https://x/b.webp");
        std::fs::write(temp_dir.path().join(format!("{}.webp", without_uri)), b"img").unwrap();

        let json = serde_json::json!({
            with_uri.clone(): { "uri": "https://x/a.png", "timestamp": 1_700_000_000_000i64, "size": 10 },
            without_uri.clone(): { "timestamp": 1_700_000_000_000i64, "size": 3 },
            "orphan": { "timestamp": 1_700_000_000_000i64, "size": 3 },
        });
        std::fs::write(&path, json.to_string()).unwrap();

        let index = read_index(&path).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&with_uri).unwrap().file, format!("{}.png", with_uri));
        assert_eq!(index.get(&without_uri).unwrap().file, format!("{}.webp", without_uri));
        assert!(index.get("orphan").is_none());
    }

    #[tokio::test]
    async fn test_read_index_drops_paths_outside_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");

        let json = serde_json::json!({
            "up": { "file": "../../x", "timestamp": 0, "size": 1 },
            "abs": { "file": "/etc/passwd", "timestamp": 0, "size": 1 },
            "nested": { "file": "a/b.jpg", "timestamp": 0, "size": 1 },
            "ok": { "file": "ok.jpg", "timestamp": 0, "size": 1 },
        });
        std::fs::write(&path, json.to_string()).unwrap();

        let index = read_index(&path).await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.get("ok").is_some());
    }

    #[test]
    fn test_is_plain_file_name() {
        assert!(is_plain_file_name("abc.jpg"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name("a/b"));
        assert!(!is_plain_file_name("a/"));
        assert!(!is_plain_file_name("/abs"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_private_replaces_stale_temp() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secret");
        let stale = temp_dir.path().join("secret.tmp");
        std::fs::write(&stale, b"old").unwrap();
        std::fs::set_permissions(&stale, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_private(&path, b"new").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_read_corrupt_index_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(read_index(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        delete(&temp_dir.path().join("gone.jpg")).await.unwrap();
        delete_dir(&temp_dir.path().join("gone")).await.unwrap();
    }

    #[test]
    fn test_entry_expiry() {
        let e = entry("a", 8, 1);
        assert!(e.is_expired(DEFAULT_TTL, Utc::now()));

        let fresh = entry("b", 1, 1);
        assert!(!fresh.is_expired(DEFAULT_TTL, Utc::now()));
    }

    #[test]
    fn test_take_expired() {
        let mut index = CacheIndex::new();
        index.insert(entry("old", 10, 1));
        index.insert(entry("new", 1, 1));

        let expired = index.take_expired(DEFAULT_TTL, Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, "old");
        assert!(index.get("new").is_some());
    }

    #[test]
    fn test_take_oldest_rounds_up() {
        let mut index = CacheIndex::new();
        for (i, key) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            index.insert(entry(key, 10 - i as i64, 1));
        }

        // 30% of 5 rounds up to 2: the two oldest are a and b.
        let mut removed: Vec<String> =
            index.take_oldest(30).into_iter().map(|e| e.key).collect();
        removed.sort();
        assert_eq!(removed, vec!["a", "b"]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_take_oldest_single_entry() {
        let mut index = CacheIndex::new();
        index.insert(entry("only", 0, 1));
        assert_eq!(index.take_oldest(30).len(), 1);
        assert!(index.take_oldest(30).is_empty());
    }
}
