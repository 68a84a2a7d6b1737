//! Encrypted credential cache.
//!
//! Stores credential bundles and SSO tokens in a SQLite table, sealed through a
//! [`SecretStore`] before they touch disk. Each write is a single upsert
//! statement, so a concurrent reader in another process sees either the old or
//! the new row. Any read failure (missing key, tampered bytes, schema drift)
//! is a cache miss.

mod encryption;

pub use encryption::{load_or_create_key_file, AesGcmSealer, SecretStore};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::credentials::CredentialBundle;
use crate::profile::{BackendType, ProfileDefinition};
use crate::sso::portal;
use crate::sso::SsoToken;

/// How long a writer waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache failures; never surfaced past the resolver
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("cache crypto error: {0}")]
    Crypto(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache lock poisoned")]
    Lock,
}

/// The persisted unit, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheEntry {
    Credentials(CredentialBundle),
    SsoToken(SsoToken),
}

/// Stable address of a cache entry
///
/// Format: `<backend>|<profile name or issuer url>|<role arn>`. The format is
/// part of the on-disk layout and must not change between versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for the bundle produced by one hop
    ///
    /// SSO profiles name their role through the portal settings, so the account and role
    /// name feed the key and editing either one addresses a fresh entry.
    pub fn for_profile(profile: &ProfileDefinition) -> Self {
        let role = match (&profile.role_arn, &profile.sso) {
            (Some(arn), _) => arn.clone(),
            (None, Some(sso)) if profile.backend_type == BackendType::SsoOidc => {
                portal::role_arn(sso)
            }
            _ => String::new(),
        };
        Self(format!(
            "{}|{}|{}",
            profile.backend_type.as_str(),
            profile.name,
            role
        ))
    }

    /// Key for the SSO token issued by `issuer_url`
    pub fn for_sso_token(issuer_url: &str) -> Self {
        Self(format!("sso-token|{}|", issuer_url.trim_end_matches('/')))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encrypted key-value cache backed by SQLite
///
/// # Schema
/// ```sql
/// CREATE TABLE cache_entries (
///     key TEXT PRIMARY KEY,
///     payload BLOB NOT NULL,     -- nonce || AES-GCM ciphertext
///     updated_at TEXT NOT NULL   -- ISO 8601 timestamp
/// );
/// ```
pub struct SecureCache {
    conn: Mutex<Connection>,
    sealer: Arc<dyn SecretStore>,
}

impl SecureCache {
    /// Open or create the cache database at `path`
    pub fn open<P: AsRef<Path>>(path: P, sealer: Arc<dyn SecretStore>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cache directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache database: {}", path.display()))?;
        Self::with_connection(conn, sealer)
    }

    /// Open the database at `path`, falling back to a process-local cache when it is unusable
    ///
    /// A corrupt or unwritable database must not block resolution; entries simply are not
    /// persisted for this run.
    pub fn open_or_in_memory<P: AsRef<Path>>(
        path: P,
        sealer: Arc<dyn SecretStore>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match Self::open(path, sealer.clone()) {
            Ok(cache) => Ok(cache),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "Cache unavailable, continuing without persistence: {:#}",
                    e
                );
                Self::in_memory(sealer)
            }
        }
    }

    /// Cache living only for the lifetime of the process
    pub fn in_memory(sealer: Arc<dyn SecretStore>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let conn = Connection::open_in_memory().context("Failed to open in-memory cache")?;
        Self::with_connection(conn, sealer)
    }

    fn with_connection(conn: Connection, sealer: Arc<dyn SecretStore>) -> anyhow::Result<Self> {
        use anyhow::Context;

        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set cache busy timeout")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create cache table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            sealer,
        })
    }

    /// Look up an entry; every failure is reported as a miss
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.try_get(key) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Cached credential bundle under `key`, if the entry holds one
    pub fn get_credentials(&self, key: &CacheKey) -> Option<CredentialBundle> {
        match self.get(key)? {
            CacheEntry::Credentials(bundle) => Some(bundle),
            CacheEntry::SsoToken(_) => {
                tracing::debug!(key = %key, "Cache entry holds an SSO token, expected credentials");
                None
            }
        }
    }

    /// Cached SSO token under `key`, if the entry holds one
    pub fn get_sso_token(&self, key: &CacheKey) -> Option<SsoToken> {
        match self.get(key)? {
            CacheEntry::SsoToken(token) => Some(token),
            CacheEntry::Credentials(_) => {
                tracing::debug!(key = %key, "Cache entry holds credentials, expected an SSO token");
                None
            }
        }
    }

    fn try_get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let payload: Option<Vec<u8>> = {
            let conn = self.conn.lock().map_err(|_| CacheError::Lock)?;
            conn.query_row(
                "SELECT payload FROM cache_entries WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(sealed) = payload else {
            return Ok(None);
        };

        let plaintext = self.sealer.open(&sealed)?;
        let entry = serde_json::from_slice(&plaintext)?;
        Ok(Some(entry))
    }

    /// Store `entry` under `key`, replacing any previous value atomically
    pub fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let plaintext = serde_json::to_vec(entry)?;
        let sealed = self.sealer.seal(&plaintext)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock().map_err(|_| CacheError::Lock)?;
        conn.execute(
            r#"
            INSERT INTO cache_entries (key, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
            params![key.as_str(), sealed, now],
        )?;

        tracing::debug!(key = %key, "Cache entry written");
        Ok(())
    }

    /// Remove the entry under `key`; returns whether one existed
    pub fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Lock)?;
        let rows = conn.execute(
            "DELETE FROM cache_entries WHERE key = ?1",
            params![key.as_str()],
        )?;
        if rows > 0 {
            tracing::debug!(key = %key, "Cache entry deleted");
        }
        Ok(rows > 0)
    }

    /// Remove every entry; returns how many were removed
    pub fn clear(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Lock)?;
        let rows = conn.execute("DELETE FROM cache_entries", [])?;
        Ok(rows)
    }

    /// Number of stored entries, readable or not
    pub fn len(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Lock)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}
