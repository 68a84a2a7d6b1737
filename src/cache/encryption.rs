//! AES-256-GCM sealing for cache entries.
//!
//! Every sealed payload carries its own random 96-bit nonce as a prefix, so the
//! same plaintext never produces the same ciphertext twice. The 32-byte key is
//! supplied from outside the cache (environment variable or a key file kept
//! away from the cache database).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::path::Path;

use super::CacheError;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Seals and opens opaque byte payloads
///
/// Implementations own the key material; the cache never sees it.
pub trait SecretStore: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CacheError>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CacheError>;
}

/// AES-256-GCM secret store
pub struct AesGcmSealer {
    cipher: Aes256Gcm,
}

impl AesGcmSealer {
    /// Create a sealer from raw key bytes
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Create a sealer from a base64-encoded 32-byte key
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?;
        Self::from_key_bytes(&key_bytes)
    }

    /// Sealer with a random key that lives only as long as this process
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Generate a fresh random key, base64-encoded
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        BASE64.encode(key)
    }
}

impl SecretStore for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CacheError> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CacheError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CacheError> {
        if sealed.len() <= NONCE_SIZE {
            return Err(CacheError::Crypto(format!(
                "Sealed payload too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| {
                CacheError::Crypto(format!(
                    "Decryption failed (wrong key or corrupted data): {}",
                    e
                ))
            })
    }
}

/// Read the base64 key stored at `path`, creating it with a new random key if absent
///
/// On unix the file is created readable by the owner only.
pub fn load_or_create_key_file(path: &Path) -> Result<String> {
    if path.exists() {
        let key = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache key file: {}", path.display()))?;
        return Ok(key.trim().to_string());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let key = AesGcmSealer::generate_key();
    write_private(path, key.as_bytes())
        .with_context(|| format!("Failed to write cache key file: {}", path.display()))?;
    tracing::info!("Generated new cache key at {}", path.display());

    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
