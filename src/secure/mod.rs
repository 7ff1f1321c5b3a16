// Secure storage module.
// Seals small secrets under a per-installation key and detects tampering on read.

pub mod scheme;
pub mod storage;
pub mod store;

pub use scheme::{EncryptionKey, SecretScheme};
pub use storage::{ENCRYPTION_KEY_ID, SecureStorage};
pub use store::{FileSecretStore, MemorySecretStore, SecretStore};

use crate::config::SecureConfig;

/// Pick the store for this platform: files where there is a directory, memory otherwise.
pub fn open_store(config: &SecureConfig) -> Box<dyn SecretStore> {
    match &config.secrets_dir {
        Some(dir) => {
            let store = FileSecretStore::new(dir);
            tracing::debug!(dir = %store.dir().display(), "Using file secret store");
            Box::new(store)
        }
        None => {
            tracing::warn!("No secrets directory available, secrets will not outlive the process");
            Box::new(MemorySecretStore::new())
        }
    }
}

/// Secure storage wired up from configuration.
pub fn open(config: &SecureConfig) -> SecureStorage<Box<dyn SecretStore>> {
    SecureStorage::new(open_store(config), config.scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = SecureConfig {
            secrets_dir: Some(temp_dir.path().to_path_buf()),
            scheme: SecretScheme::IntegrityDigest,
        };

        let storage = open(&config);
        assert_eq!(storage.scheme(), SecretScheme::IntegrityDigest);
        storage.set_secure_item("k", "v").await.unwrap();
        assert_eq!(storage.get_secure_item("k").await.unwrap(), Some("v".to_string()));
        assert!(std::fs::read_dir(temp_dir.path()).unwrap().count() >= 2);
    }

    #[tokio::test]
    async fn test_open_without_dir_uses_memory() {
        let config = SecureConfig {
            secrets_dir: None,
            scheme: SecretScheme::default(),
        };

        let storage = open(&config);
        storage.set_secure_item("k", "v").await.unwrap();
        assert_eq!(storage.get_secure_item("k").await.unwrap(), Some("v".to_string()));
    }
}
