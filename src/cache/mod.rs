// Cache module for locally persisted images.
// Keeps remote images on disk, keyed by a hash of their URI, with TTL and size limits.

pub mod fetch;
pub mod manager;
pub mod paths;
pub mod store;

pub use fetch::{HttpFetcher, ImageFetcher};
pub use manager::{CacheStats, ImageCacheManager};
pub use store::{CacheEntry, CacheIndex, DEFAULT_MAX_BYTES, DEFAULT_TTL};
