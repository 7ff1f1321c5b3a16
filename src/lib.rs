// eGarden core library.
// Local image caching and secure secret storage for the eGarden plant-care app.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod secure;

pub use cache::{CacheStats, ImageCacheManager};
pub use config::{CacheConfig, SecureConfig};
pub use error::{EgardenError, Result};
pub use secure::{SecretScheme, SecureStorage};
