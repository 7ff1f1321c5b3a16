// Secure storage helper.
// Seals secrets under the installation key before they reach the confidential store.

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::scheme::{EncryptionKey, SecretScheme};
use super::store::SecretStore;
use crate::error::{EgardenError, Result};

/// Store key the installation's encryption key lives under.
pub const ENCRYPTION_KEY_ID: &str = "egarden.encryption_key";

/// Encrypted key-value storage for small secrets.
pub struct SecureStorage<S: SecretStore> {
    store: S,
    scheme: SecretScheme,
    key: OnceCell<EncryptionKey>,
}

impl<S: SecretStore> SecureStorage<S> {
    pub fn new(store: S, scheme: SecretScheme) -> Self {
        Self {
            store,
            scheme,
            key: OnceCell::new(),
        }
    }

    pub fn scheme(&self) -> SecretScheme {
        self.scheme
    }

    /// Underlying store, holding only sealed values.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load the installation key, generating and persisting one on first run.
    pub async fn initialize(&self) -> Result<()> {
        self.key().await.map(|_| ())
    }

    async fn key(&self) -> Result<&EncryptionKey> {
        self.key
            .get_or_try_init(|| async {
                if let Some(stored) = self.store.get(ENCRYPTION_KEY_ID).await? {
                    match EncryptionKey::from_hex(&stored) {
                        Ok(key) => {
                            debug!("Loaded installation encryption key");
                            return Ok::<_, EgardenError>(key);
                        }
                        // Anything sealed under the old key becomes unreadable.
                        Err(e) => warn!(error = %e, "Stored encryption key is unusable, replacing it"),
                    }
                }

                let key = EncryptionKey::generate();
                self.store.set(ENCRYPTION_KEY_ID, &key.to_hex()).await?;
                info!("Generated new installation encryption key");
                Ok(key)
            })
            .await
    }

    /// Seal `plaintext` under the installation key.
    pub async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let key = self.key().await?;
        self.scheme.seal(key, plaintext)
    }

    /// Open a sealed value. Fails if it does not verify.
    pub async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let key = self.key().await?;
        self.scheme.open(key, ciphertext)
    }

    pub async fn set_secure_item(&self, key: &str, value: &str) -> Result<()> {
        ensure_not_reserved(key)?;
        let sealed = self.encrypt(value).await?;
        self.store.set(key, &sealed).await
    }

    /// `None` if nothing is stored under `key`; an error if the stored value was tampered with.
    pub async fn get_secure_item(&self, key: &str) -> Result<Option<String>> {
        ensure_not_reserved(key)?;
        let Some(sealed) = self.store.get(key).await? else {
            return Ok(None);
        };

        match self.decrypt(&sealed).await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Secure item failed verification");
                Err(e)
            }
        }
    }

    pub async fn delete_secure_item(&self, key: &str) -> Result<()> {
        ensure_not_reserved(key)?;
        self.store.delete(key).await
    }
}

fn ensure_not_reserved(key: &str) -> Result<()> {
    if key == ENCRYPTION_KEY_ID {
        return Err(EgardenError::Other(format!("{} is a reserved key", key)));
    }
    Ok(())
}

impl<S: SecretStore + std::fmt::Debug> std::fmt::Debug for SecureStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage")
            .field("store", &self.store)
            .field("scheme", &self.scheme)
            .field("initialized", &self.key.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::store::{FileSecretStore, MemorySecretStore};
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use tempfile::TempDir;

    const SCHEMES: [SecretScheme; 2] = [SecretScheme::IntegrityDigest, SecretScheme::Aes256Gcm];

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        for scheme in SCHEMES {
            let storage = SecureStorage::new(MemorySecretStore::new(), scheme);
            storage.set_secure_item("auth_token", "abc.def.ghi").await.unwrap();

            assert_eq!(
                storage.get_secure_item("auth_token").await.unwrap(),
                Some("abc.def.ghi".to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_stored_value_is_not_plaintext() {
        let storage = SecureStorage::new(MemorySecretStore::new(), SecretScheme::Aes256Gcm);
        storage.set_secure_item("pin", "1234").await.unwrap();

        let raw = storage.store().get("pin").await.unwrap().unwrap();
        assert_ne!(raw, "1234");
        let decoded = BASE64.decode(&raw).unwrap();
        assert!(!decoded.windows(4).any(|w| w == b"1234"));
    }

    #[tokio::test]
    async fn test_missing_item_is_none() {
        let storage = SecureStorage::new(MemorySecretStore::new(), SecretScheme::default());
        assert_eq!(storage.get_secure_item("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_item() {
        let storage = SecureStorage::new(MemorySecretStore::new(), SecretScheme::default());
        storage.delete_secure_item("never-set").await.unwrap();

        storage.set_secure_item("k", "v").await.unwrap();
        storage.delete_secure_item("k").await.unwrap();
        assert_eq!(storage.get_secure_item("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tampered_item_fails_closed() {
        for scheme in SCHEMES {
            let storage = SecureStorage::new(MemorySecretStore::new(), scheme);
            storage.set_secure_item("k", "garden-secret").await.unwrap();

            let raw = storage.store().get("k").await.unwrap().unwrap();
            let len = BASE64.decode(&raw).unwrap().len();
            for i in 0..len {
                let mut bytes = BASE64.decode(&raw).unwrap();
                bytes[i] ^= 0x80;
                storage.store().set("k", &BASE64.encode(bytes)).await.unwrap();

                let result = storage.get_secure_item("k").await;
                assert!(matches!(result, Err(EgardenError::Decryption(_))));
            }
        }
    }

    #[tokio::test]
    async fn test_initialize_persists_key_once() {
        let storage = SecureStorage::new(MemorySecretStore::new(), SecretScheme::default());
        storage.initialize().await.unwrap();
        let first = storage.store().get(ENCRYPTION_KEY_ID).await.unwrap().unwrap();

        storage.initialize().await.unwrap();
        let second = storage.store().get(ENCRYPTION_KEY_ID).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn test_key_reused_across_instances() {
        let temp_dir = TempDir::new().unwrap();

        let storage = SecureStorage::new(
            FileSecretStore::new(temp_dir.path()),
            SecretScheme::Aes256Gcm,
        );
        storage.set_secure_item("refresh", "r-1").await.unwrap();

        let reopened = SecureStorage::new(
            FileSecretStore::new(temp_dir.path()),
            SecretScheme::Aes256Gcm,
        );
        assert_eq!(
            reopened.get_secure_item("refresh").await.unwrap(),
            Some("r-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_unusable_stored_key_is_replaced() {
        let store = MemorySecretStore::new();
        store.set(ENCRYPTION_KEY_ID, "not-a-key").await.unwrap();

        let storage = SecureStorage::new(store, SecretScheme::default());
        storage.initialize().await.unwrap();

        let stored = storage.store().get(ENCRYPTION_KEY_ID).await.unwrap().unwrap();
        assert!(EncryptionKey::from_hex(&stored).is_ok());
    }

    #[tokio::test]
    async fn test_reserved_key_rejected() {
        let storage = SecureStorage::new(MemorySecretStore::new(), SecretScheme::default());
        assert!(storage.set_secure_item(ENCRYPTION_KEY_ID, "x").await.is_err());
        assert!(storage.delete_secure_item(ENCRYPTION_KEY_ID).await.is_err());

        storage.initialize().await.unwrap();
        let err = storage.get_secure_item(ENCRYPTION_KEY_ID).await.unwrap_err();
        assert!(matches!(err, EgardenError::Other(_)));
    }

    #[tokio::test]
    async fn test_encrypt_decrypt() {
        let storage = SecureStorage::new(MemorySecretStore::new(), SecretScheme::IntegrityDigest);
        let sealed = storage.encrypt("hello").await.unwrap();
        assert_eq!(storage.decrypt(&sealed).await.unwrap(), "hello");
    }
}
