// Profile graph resolution
// Walks the source_profile chain root to leaf, consulting the cache per hop

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::assume::{AssumeContext, Assumer, AssumerRegistry, BackoffPolicy};
use crate::cache::{CacheEntry, CacheKey, SecureCache};
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, ConfigurationKind, ResolveError};
use crate::profile::{ProfileDefinition, ProfileStore};

/// Smallest safety margin ever applied to cached credentials
pub const MIN_SAFETY_MARGIN_SECS: i64 = 30;

/// Expiry and retry policy for a resolution
#[derive(Debug, Clone, Copy)]
pub struct ResolvePolicy {
    /// Cached bundles must stay valid at least this long to be reused
    pub safety_margin: Duration,

    /// Retry schedule for transient hop failures
    pub backoff: BackoffPolicy,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::seconds(MIN_SAFETY_MARGIN_SECS),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ResolvePolicy {
    /// Build a policy; margins below the minimum are raised to it
    pub fn new(safety_margin_secs: i64, backoff: BackoffPolicy) -> Self {
        Self {
            safety_margin: Duration::seconds(safety_margin_secs.max(MIN_SAFETY_MARGIN_SECS)),
            backoff,
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Ignore cached bundles; results are still written back
    pub force_refresh: bool,
}

/// Resolves profiles into credential bundles
pub struct ProfileResolver {
    store: ProfileStore,
    registry: AssumerRegistry,
    cache: Arc<SecureCache>,
    policy: ResolvePolicy,
}

impl ProfileResolver {
    pub fn new(
        store: ProfileStore,
        registry: AssumerRegistry,
        cache: Arc<SecureCache>,
        policy: ResolvePolicy,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            policy,
        }
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn cache(&self) -> &SecureCache {
        &self.cache
    }

    /// Resolve `name` into the leaf bundle of its chain
    pub async fn resolve(
        &self,
        ctx: &AssumeContext,
        name: &str,
        options: ResolveOptions,
    ) -> Result<CredentialBundle, ResolveError> {
        let chain = self
            .store
            .chain(name)
            .map_err(|e| ResolveError::before_chain(name, e))?;

        // Every hop needs an assumer before any of them runs
        let assumers = chain
            .hops()
            .iter()
            .enumerate()
            .map(|(index, profile)| {
                self.registry
                    .select(profile)
                    .map_err(|e| hop_error(profile, index + 1, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            profile = name,
            hops = chain.len(),
            "Resolving chain {}",
            chain.names().join(" -> ")
        );

        let mut parent: Option<CredentialBundle> = None;

        for (index, (profile, assumer)) in chain.hops().iter().zip(assumers).enumerate() {
            let hop = index + 1;
            let key = CacheKey::for_profile(profile);

            if !options.force_refresh {
                if let Some(bundle) = self.cached(&key) {
                    tracing::debug!(
                        profile = %profile.name,
                        hop = hop,
                        expires_at = %bundle.expires_at.to_rfc3339(),
                        "Using cached credentials"
                    );
                    parent = Some(bundle);
                    continue;
                }
            }

            let bundle = self
                .assume_hop(ctx, profile, assumer.as_ref(), parent.as_ref(), &key)
                .await
                .map_err(|e| hop_error(profile, hop, e))?;

            if let Err(e) = self
                .cache
                .put(&key, &CacheEntry::Credentials(bundle.clone()))
            {
                tracing::warn!(key = %key, "Failed to cache credentials: {}", e);
            }

            parent = Some(bundle);
        }

        parent.ok_or_else(|| {
            ResolveError::before_chain(
                name,
                AssumeError::configuration(
                    ConfigurationKind::UnknownProfile,
                    name,
                    "empty profile chain",
                ),
            )
        })
    }

    /// Cached bundle that outlives the safety margin
    fn cached(&self, key: &CacheKey) -> Option<CredentialBundle> {
        self.cache
            .get_credentials(key)
            .filter(|bundle| bundle.is_valid_beyond(Utc::now(), self.policy.safety_margin))
    }

    /// Run one assumer with the retry policy
    ///
    /// Transient errors back off up to the attempt ceiling. `ExpiredAuth` is retried
    /// once with a forced fresh login. `NoAccess` and a second `ExpiredAuth` drop the
    /// hop's cache entry before failing.
    async fn assume_hop(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        assumer: &dyn Assumer,
        parent: Option<&CredentialBundle>,
        key: &CacheKey,
    ) -> Result<CredentialBundle, AssumeError> {
        let mut hop_ctx = ctx.clone();
        let mut failures: u32 = 0;
        let mut relogged = false;

        loop {
            if ctx.is_cancelled() {
                return Err(AssumeError::Cancelled);
            }

            tracing::debug!(profile = %profile.name, assumer = assumer.name(), "Assuming");

            let result = match assumer.assume(&hop_ctx, profile, parent).await {
                Ok(bundle) if bundle.is_expired_at(Utc::now()) => Err(AssumeError::ExpiredAuth(
                    format!("{} returned credentials that are already expired", assumer.name()),
                )),
                other => other,
            };

            match result {
                Ok(bundle) => return Ok(bundle),
                Err(AssumeError::ExpiredAuth(message)) if !relogged => {
                    tracing::warn!(
                        profile = %profile.name,
                        "Authentication expired, retrying with a fresh login: {}",
                        message
                    );
                    self.drop_entry(key);
                    relogged = true;
                    hop_ctx = ctx.with_force_login();
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.policy.backoff.should_retry(failures) {
                        tracing::error!(
                            profile = %profile.name,
                            attempts = failures,
                            "Giving up after transient failures: {}",
                            e
                        );
                        return Err(e);
                    }
                    let delay = self.policy.backoff.delay_for(failures);
                    tracing::warn!(
                        profile = %profile.name,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, backing off: {}",
                        e
                    );
                    ctx.sleep(delay).await?;
                }
                Err(e @ (AssumeError::NoAccess { .. } | AssumeError::ExpiredAuth(_))) => {
                    self.drop_entry(key);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn drop_entry(&self, key: &CacheKey) {
        if let Err(e) = self.cache.delete(key) {
            tracing::warn!(key = %key, "Failed to delete cache entry: {}", e);
        }
    }
}

fn hop_error(profile: &ProfileDefinition, hop: usize, source: AssumeError) -> ResolveError {
    ResolveError {
        profile: profile.name.clone(),
        backend: Some(profile.backend_type),
        hop,
        source,
    }
}
