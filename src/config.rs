// Runtime configuration for the cache and the secure store.
// Defaults come from the platform directories; environment variables override them.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::paths;
use crate::cache::store::{DEFAULT_MAX_BYTES, DEFAULT_TTL};
use crate::error::{EgardenError, Result};
use crate::secure::SecretScheme;

/// Default share of entries removed by one eviction pass.
pub const DEFAULT_EVICT_PERCENT: usize = 30;

/// Image cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache directory. `None` means no persistent filesystem is available.
    pub cache_dir: Option<PathBuf>,
    /// How long a cached image stays valid.
    pub ttl: Duration,
    /// Aggregate size cap for cached files.
    pub max_bytes: u64,
    /// Percent of entries removed, oldest first, per eviction pass.
    pub evict_percent: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: if cfg!(target_family = "wasm") {
                None
            } else {
                paths::cache_dir()
            },
            ttl: DEFAULT_TTL,
            max_bytes: DEFAULT_MAX_BYTES,
            evict_percent: DEFAULT_EVICT_PERCENT,
        }
    }
}

impl CacheConfig {
    /// Settings rooted at an explicit directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Load defaults, then apply EGARDEN_CACHE_DIR, EGARDEN_CACHE_TTL_SECS and EGARDEN_CACHE_MAX_MB.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("EGARDEN_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(secs) = std::env::var("EGARDEN_CACHE_TTL_SECS") {
            config.ttl = Duration::from_secs(parse_number("EGARDEN_CACHE_TTL_SECS", &secs)?);
        }
        if let Ok(mb) = std::env::var("EGARDEN_CACHE_MAX_MB") {
            config.max_bytes = megabytes_to_bytes("EGARDEN_CACHE_MAX_MB", &mb)?;
        }

        Ok(config)
    }

    /// Configured cap in megabytes.
    pub fn max_mb(&self) -> f64 {
        self.max_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Secure storage settings.
#[derive(Debug, Clone)]
pub struct SecureConfig {
    /// Directory for the file-backed secret store.
    pub secrets_dir: Option<PathBuf>,
    /// How secrets are sealed before they are written.
    pub scheme: SecretScheme,
}

impl Default for SecureConfig {
    fn default() -> Self {
        Self {
            secrets_dir: if cfg!(target_family = "wasm") {
                None
            } else {
                paths::secrets_dir()
            },
            scheme: SecretScheme::default(),
        }
    }
}

impl SecureConfig {
    /// Load defaults, then apply EGARDEN_SECRETS_DIR and EGARDEN_SECRET_SCHEME.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("EGARDEN_SECRETS_DIR") {
            config.secrets_dir = Some(PathBuf::from(dir));
        }
        if let Ok(scheme) = std::env::var("EGARDEN_SECRET_SCHEME") {
            config.scheme = scheme.parse()?;
        }

        Ok(config)
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| EgardenError::Config(format!("{} must be a whole number, got {:?}", name, value)))
}

fn megabytes_to_bytes(name: &str, value: &str) -> Result<u64> {
    parse_number(name, value)?
        .checked_mul(1024 * 1024)
        .ok_or_else(|| EgardenError::Config(format!("{} is too large: {}", name, value.trim())))
}
