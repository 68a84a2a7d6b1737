use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::assume::BackoffPolicy;
use crate::cache::{load_or_create_key_file, AesGcmSealer, SecureCache};
use crate::profile::{ProfileDefinition, ProfileStore};
use crate::resolver::{ResolvePolicy, MIN_SAFETY_MARGIN_SECS};
use crate::sso::FlowPolicy;

/// Rolegate - resolve chained role profiles into short-lived credentials
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Profile to resolve
    #[arg(env = "ROLEGATE_PROFILE")]
    pub profile: Option<String>,

    /// Profiles file (TOML)
    #[arg(short = 'c', long = "config", env = "ROLEGATE_CONFIG")]
    pub config_file: Option<String>,

    /// Path to the credential cache database
    #[arg(long, env = "ROLEGATE_CACHE_DB")]
    pub cache_db: Option<String>,

    /// Path to the cache encryption key file
    #[arg(long, env = "ROLEGATE_KEY_FILE")]
    pub key_file: Option<String>,

    /// Output format
    #[arg(short = 'f', long, env = "ROLEGATE_FORMAT", value_enum, default_value = "env")]
    pub format: OutputFormat,

    /// Ignore cached credentials (results are still cached)
    #[arg(long)]
    pub no_cache: bool,

    /// Delete every cached entry and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// List configured profiles and exit
    #[arg(long)]
    pub list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,
}

/// How resolved credentials are printed
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Shell `export` lines
    Env,
    /// `credential_process` JSON document
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub profile: Option<String>,

    // Files
    pub profiles_file: PathBuf,
    pub cache_db: PathBuf,
    pub key_file: PathBuf,

    // Output and actions
    pub format: OutputFormat,
    pub no_cache: bool,
    pub clear_cache: bool,
    pub list: bool,

    // Logging
    pub log_level: String,
    pub log_json: bool,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Resolution policy
    pub cache_margin_secs: i64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_max_attempts: u32,
    pub sso_refresh_grace_secs: i64,
    pub sso_slow_down_step_secs: u64,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments, filling the rest from the environment
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let base = config_dir()?;

        let config = Config {
            profile: args.profile,

            profiles_file: args
                .config_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|| base.join("profiles.toml")),
            cache_db: args
                .cache_db
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|| base.join("cache.db")),
            key_file: args
                .key_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|| base.join("cache.key")),

            format: args.format,
            no_cache: args.no_cache,
            clear_cache: args.clear_cache,
            list: args.list,

            log_level: args.log_level,
            log_json: args.log_json,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            http_request_timeout: args.http_timeout,

            cache_margin_secs: std::env::var("ROLEGATE_CACHE_MARGIN_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(MIN_SAFETY_MARGIN_SECS),
            backoff_base_ms: std::env::var("ROLEGATE_BACKOFF_BASE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            backoff_max_ms: std::env::var("ROLEGATE_BACKOFF_MAX_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30_000),
            backoff_max_attempts: std::env::var("ROLEGATE_BACKOFF_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            sso_refresh_grace_secs: std::env::var("ROLEGATE_SSO_REFRESH_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            sso_slow_down_step_secs: std::env::var("ROLEGATE_SSO_SLOW_DOWN_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.clear_cache && !self.profiles_file.exists() {
            anyhow::bail!(
                "Profiles file does not exist: {} (use -c or set ROLEGATE_CONFIG)",
                self.profiles_file.display()
            );
        }

        if !self.clear_cache && !self.list && self.profile.is_none() {
            anyhow::bail!("No profile given (pass a profile name or set ROLEGATE_PROFILE)");
        }

        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_max_attempts,
        )
    }

    pub fn resolve_policy(&self) -> ResolvePolicy {
        ResolvePolicy::new(self.cache_margin_secs, self.backoff_policy())
    }

    pub fn flow_policy(&self) -> FlowPolicy {
        FlowPolicy {
            slow_down_step: Duration::from_secs(self.sso_slow_down_step_secs),
            backoff: self.backoff_policy(),
            ..FlowPolicy::default()
        }
    }

    pub fn sso_refresh_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sso_refresh_grace_secs.max(0))
    }

    /// Cache sealer keyed from ROLEGATE_CACHE_KEY, or from the key file (created on first use)
    pub fn cache_sealer(&self) -> Result<AesGcmSealer> {
        if let Ok(key) = std::env::var("ROLEGATE_CACHE_KEY") {
            if !key.trim().is_empty() {
                return AesGcmSealer::from_base64_key(key.trim())
                    .context("ROLEGATE_CACHE_KEY is not a valid base64 encoded 32-byte key");
            }
        }

        let key = load_or_create_key_file(&self.key_file)?;
        AesGcmSealer::from_base64_key(&key).with_context(|| {
            format!("Invalid cache key in {}", self.key_file.display())
        })
    }

    /// Cache used for resolution
    ///
    /// An unusable key or database degrades to a process-local cache so resolution can
    /// still go through the backends.
    pub fn open_cache(&self) -> Result<SecureCache> {
        match self.cache_sealer() {
            Ok(sealer) => SecureCache::open_or_in_memory(&self.cache_db, Arc::new(sealer)),
            Err(e) => {
                tracing::warn!("Cache key unavailable, continuing without persistence: {:#}", e);
                SecureCache::in_memory(Arc::new(AesGcmSealer::ephemeral()))
            }
        }
    }
}

/// Default directory for the profiles file, cache and key
fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Cannot determine the user config directory")?;
    Ok(base.join(env!("CARGO_PKG_NAME")))
}

/// Expand tilde (~) in file paths to user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Layout of the profiles file: one `[profiles.<name>]` table per profile
#[derive(Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: HashMap<String, ProfileDefinition>,
}

/// Load and validate profiles from a TOML file
pub fn load_profiles(path: &Path) -> Result<ProfileStore> {
    tracing::debug!("Loading profiles from {}", path.display());
    let source = config::File::from(path).format(config::FileFormat::Toml);
    build_store(source).with_context(|| format!("Failed to load profiles from {}", path.display()))
}

/// Load and validate profiles from TOML text
pub fn load_profiles_from_str(toml: &str) -> Result<ProfileStore> {
    build_store(config::File::from_str(toml, config::FileFormat::Toml))
}

fn build_store<S>(source: S) -> Result<ProfileStore>
where
    S: config::Source + Send + Sync + 'static,
{
    let settings = config::Config::builder()
        .add_source(source)
        .build()
        .context("Failed to parse profiles")?;
    let file: ProfilesFile = settings
        .try_deserialize()
        .context("Invalid profile definition")?;

    for (name, profile) in &file.profiles {
        profile
            .validate()
            .map_err(|message| anyhow::anyhow!("Profile '{}': {}", name, message))?;
    }

    let store = ProfileStore::from_map(file.profiles);
    tracing::debug!("Loaded {} profiles", store.len());
    Ok(store)
}
