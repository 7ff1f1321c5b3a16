// Sealing schemes for stored secrets.
// Both schemes fail closed: a value that does not verify is never returned.

use std::fmt;
use std::str::FromStr;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{EgardenError, Result};

/// Separator between plaintext and digest in the integrity-digest encoding.
pub const DIGEST_SEPARATOR: &str = "::";

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Per-installation symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse the hex form written by [`EncryptionKey::to_hex`].
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| EgardenError::Other(format!("invalid encryption key: {}", e)))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            EgardenError::Other(format!("encryption key must be {} bytes", KEY_SIZE))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// How a secret is sealed before it reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretScheme {
    /// `base64(plaintext + "::" + sha256_hex(plaintext + key_hex))`.
    /// Detects tampering but keeps the plaintext readable to anyone with the store.
    IntegrityDigest,
    /// `base64(nonce || AES-256-GCM ciphertext)`.
    #[default]
    Aes256Gcm,
}

impl SecretScheme {
    pub fn seal(self, key: &EncryptionKey, plaintext: &str) -> Result<String> {
        match self {
            SecretScheme::IntegrityDigest => Ok(seal_digest(key, plaintext)),
            SecretScheme::Aes256Gcm => seal_aead(key, plaintext),
        }
    }

    pub fn open(self, key: &EncryptionKey, sealed: &str) -> Result<String> {
        match self {
            SecretScheme::IntegrityDigest => open_digest(key, sealed),
            SecretScheme::Aes256Gcm => open_aead(key, sealed),
        }
    }
}

impl FromStr for SecretScheme {
    type Err = EgardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "digest" | "integrity-digest" => Ok(SecretScheme::IntegrityDigest),
            "aes-gcm" | "aes256gcm" | "aes-256-gcm" => Ok(SecretScheme::Aes256Gcm),
            other => Err(EgardenError::Config(format!(
                "unknown secret scheme {:?}, expected digest or aes-gcm",
                other
            ))),
        }
    }
}

fn digest(key: &EncryptionKey, plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher.update(key.to_hex().as_bytes());
    hex::encode(hasher.finalize())
}

fn seal_digest(key: &EncryptionKey, plaintext: &str) -> String {
    let payload = format!("{}{}{}", plaintext, DIGEST_SEPARATOR, digest(key, plaintext));
    BASE64.encode(payload)
}

fn open_digest(key: &EncryptionKey, sealed: &str) -> Result<String> {
    let payload = BASE64
        .decode(sealed)
        .map_err(|e| EgardenError::Decryption(e.to_string()))?;
    let payload = String::from_utf8(payload)
        .map_err(|_| EgardenError::Decryption("payload is not UTF-8".to_string()))?;

    // The digest is hex, so the last separator always ends the plaintext.
    let (plaintext, stored) = payload
        .rsplit_once(DIGEST_SEPARATOR)
        .ok_or_else(|| EgardenError::Decryption("missing integrity digest".to_string()))?;

    let expected = digest(key, plaintext);
    if !constant_time_eq(expected.as_bytes(), stored.as_bytes()) {
        return Err(EgardenError::Decryption(
            "integrity digest mismatch".to_string(),
        ));
    }

    Ok(plaintext.to_string())
}

fn seal_aead(key: &EncryptionKey, plaintext: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| EgardenError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

fn open_aead(key: &EncryptionKey, sealed: &str) -> Result<String> {
    let bytes = BASE64
        .decode(sealed)
        .map_err(|e| EgardenError::Decryption(e.to_string()))?;
    if bytes.len() < NONCE_SIZE {
        return Err(EgardenError::Decryption("ciphertext too short".to_string()));
    }

    let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EgardenError::Decryption("authentication tag mismatch".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| EgardenError::Decryption("plaintext is not UTF-8".to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
