use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use rolegate::assume::sts::HttpStsClient;
use rolegate::assume::{default_registry, AssumeContext};
use rolegate::cache::SecureCache;
use rolegate::config::{load_profiles, Config};
use rolegate::http_client::build_client;
use rolegate::output::render;
use rolegate::prompt::TerminalPrompt;
use rolegate::resolver::{ProfileResolver, ResolveOptions};
use rolegate::sso::{HttpOidcClient, HttpSsoPortal, SsoTokenManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    init_logging(&config);
    config.validate()?;

    tracing::debug!(
        "Using profiles {}, cache {}",
        config.profiles_file.display(),
        config.cache_db.display()
    );

    if config.clear_cache {
        let sealer = Arc::new(config.cache_sealer()?);
        let cache = SecureCache::open(&config.cache_db, sealer)
            .with_context(|| format!("Failed to open cache {}", config.cache_db.display()))?;
        let removed = cache.clear().context("Failed to clear cache")?;
        eprintln!("Removed {} cached entries", removed);
        return Ok(());
    }

    let store = load_profiles(&config.profiles_file)?;

    if config.list {
        let mut stdout = std::io::stdout().lock();
        for name in store.names() {
            if let Some(profile) = store.get(name) {
                match &profile.source_profile {
                    Some(source) => writeln!(stdout, "{}\t{}\t<- {}", name, profile.backend_type, source)?,
                    None => writeln!(stdout, "{}\t{}", name, profile.backend_type)?,
                }
            }
        }
        return Ok(());
    }

    let profile = config
        .profile
        .clone()
        .context("No profile given (pass a profile name or set ROLEGATE_PROFILE)")?;

    // Cache problems never block resolution
    let cache = Arc::new(config.open_cache()?);

    // Backends share one HTTP client
    let http = build_client(config.http_connect_timeout, config.http_request_timeout)?;
    let prompt = Arc::new(TerminalPrompt);
    let sso_tokens = Arc::new(SsoTokenManager::new(
        Arc::new(HttpOidcClient::new(http.clone())),
        prompt.clone(),
        cache.clone(),
        config.sso_refresh_grace(),
        config.flow_policy(),
    ));
    let registry = default_registry(
        Arc::new(HttpStsClient::new(http.clone())),
        prompt,
        sso_tokens,
        Arc::new(HttpSsoPortal::new(http)),
    );
    tracing::debug!("Assumers: {:?}", registry);

    let resolver = ProfileResolver::new(store, registry, cache, config.resolve_policy());

    // Ctrl-C cancels in-flight network calls and device flow polling
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let ctx = AssumeContext::new(cancel);
    let options = ResolveOptions {
        force_refresh: config.no_cache,
    };

    let bundle = resolver
        .resolve(&ctx, &profile, options)
        .await
        .with_context(|| format!("Failed to resolve profile '{}'", profile))?;

    tracing::info!(
        profile = %profile,
        expires_at = %bundle.expires_at.to_rfc3339(),
        "Credentials resolved"
    );

    print!("{}", render(&bundle, config.format)?);
    Ok(())
}

/// Logs go to stderr so stdout carries only the credentials
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if config.log_json {
        builder.json().init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }
}
