// Cache path utilities.
// Derives cache keys from image URIs and builds the on-disk layout.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use sha2::{Digest, Sha256};

/// Name of the index snapshot inside the cache directory.
pub const INDEX_FILE: &str = "index.json";

/// Extension used when the URI does not name a known image type.
pub const DEFAULT_EXTENSION: &str = "jpg";

const KNOWN_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "heic", "heif", "svg", "avif",
];

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "egarden")
}

/// Get the default image cache directory (~/.cache/egarden/images on Linux).
pub fn cache_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.cache_dir().join("images"))
}

/// Get the default directory for the file-backed secret store.
pub fn secrets_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("secure"))
}

/// Path to the index snapshot for a cache directory.
pub fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE)
}

/// Stable cache key for a URI: hex SHA-256 of the URI string itself.
pub fn cache_key(uri: &str) -> String {
    hex::encode(Sha256::digest(uri.as_bytes()))
}

/// File name an image for `uri` is stored under.
pub fn image_file_name(key: &str, uri: &str) -> String {
    format!("{}.{}", key, infer_extension(uri))
}

/// Infer an image extension from the last path segment of a URI.
/// Query strings and fragments are ignored; unknown types fall back to jpg.
pub fn infer_extension(uri: &str) -> &'static str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    // Skip past the scheme and authority so a host like "x.png" is not read as a file.
    let path = match path.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => path,
    };
    let segment = path.rsplit('/').next().unwrap_or("");

    segment
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .and_then(|ext| KNOWN_EXTENSIONS.iter().copied().find(|known| *known == ext))
        .unwrap_or(DEFAULT_EXTENSION)
}
