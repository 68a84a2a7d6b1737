// Integration tests for profile resolution
//
// These tests drive the resolver end to end with scripted assumers and a real
// encrypted in-memory cache, checking hop order, cache reuse and the retry policy.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rolegate::{
    assume::{AssumeContext, Assumer, AssumerRegistry, BackoffPolicy},
    cache::{AesGcmSealer, CacheEntry, CacheError, CacheKey, SecretStore, SecureCache},
    credentials::CredentialBundle,
    error::{AssumeError, ConfigurationKind, Result},
    profile::{BackendType, ProfileDefinition, ProfileStore, SsoSettings},
    resolver::{ProfileResolver, ResolveOptions, ResolvePolicy},
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

/// One recorded assumer invocation
#[derive(Debug, Clone)]
struct Call {
    profile: String,
    parent_key: Option<String>,
    force_login: bool,
}

/// Assumer that records calls and replays scripted failures per profile
struct ScriptedAssumer {
    backend: BackendType,
    calls: Arc<Mutex<Vec<Call>>>,
    failures: Arc<Mutex<HashMap<String, VecDeque<AssumeError>>>>,
}

#[async_trait]
impl Assumer for ScriptedAssumer {
    fn backend_type(&self) -> BackendType {
        self.backend
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn assume(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        parent: Option<&CredentialBundle>,
    ) -> Result<CredentialBundle> {
        self.calls.lock().unwrap().push(Call {
            profile: profile.name.clone(),
            parent_key: parent.map(|p| p.access_key_id.clone()),
            force_login: ctx.force_login(),
        });

        if let Some(err) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&profile.name)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        Ok(bundle_for(&profile.name, Duration::hours(1)))
    }
}

/// Sealer that counts writes
struct CountingSealer {
    inner: AesGcmSealer,
    seals: Arc<AtomicUsize>,
}

impl SecretStore for CountingSealer {
    fn seal(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, CacheError> {
        self.seals.fetch_add(1, Ordering::SeqCst);
        self.inner.seal(plaintext)
    }

    fn open(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, CacheError> {
        self.inner.open(sealed)
    }
}

struct Harness {
    calls: Arc<Mutex<Vec<Call>>>,
    failures: Arc<Mutex<HashMap<String, VecDeque<AssumeError>>>>,
    seals: Arc<AtomicUsize>,
    cache: Arc<SecureCache>,
}

impl Harness {
    fn new() -> Self {
        Self::with_cache(|sealer| SecureCache::in_memory(sealer).unwrap())
    }

    /// Harness whose cache lives in a database file
    fn on_disk(path: &Path) -> Self {
        Self::with_cache(|sealer| SecureCache::open_or_in_memory(path, sealer).unwrap())
    }

    fn with_cache(open: impl FnOnce(Arc<dyn SecretStore>) -> SecureCache) -> Self {
        let seals = Arc::new(AtomicUsize::new(0));
        let sealer = CountingSealer {
            inner: AesGcmSealer::from_key_bytes(&[42u8; 32]).unwrap(),
            seals: seals.clone(),
        };
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            seals,
            cache: Arc::new(open(Arc::new(sealer))),
        }
    }

    fn resolver(&self, profiles: Vec<ProfileDefinition>) -> ProfileResolver {
        let mut registry = AssumerRegistry::new();
        for backend in [
            BackendType::SsoOidc,
            BackendType::IamRoleChain,
            BackendType::CredentialProcess,
        ] {
            registry.register(Arc::new(ScriptedAssumer {
                backend,
                calls: self.calls.clone(),
                failures: self.failures.clone(),
            }));
        }
        ProfileResolver::new(
            ProfileStore::new(profiles),
            registry,
            self.cache.clone(),
            ResolvePolicy::default(),
        )
    }

    fn fail(&self, profile: &str, errors: Vec<AssumeError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(profile.to_string(), errors.into());
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn called_profiles(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.profile).collect()
    }

    fn writes(&self) -> usize {
        self.seals.load(Ordering::SeqCst)
    }

    fn seed(&self, profile: &ProfileDefinition, bundle: CredentialBundle) {
        self.cache
            .put(
                &CacheKey::for_profile(profile),
                &CacheEntry::Credentials(bundle),
            )
            .unwrap();
        self.seals.store(0, Ordering::SeqCst);
    }
}

fn bundle_for(profile: &str, lifetime: Duration) -> CredentialBundle {
    CredentialBundle {
        access_key_id: format!("ASIA-{}", profile),
        secret_access_key: "secret".to_string(),
        session_token: Some("session".to_string()),
        expires_at: Utc::now() + lifetime,
        source_profile_name: profile.to_string(),
    }
}

fn base_sso() -> ProfileDefinition {
    ProfileDefinition::new("base-sso", BackendType::SsoOidc).with_sso(SsoSettings {
        start_url: "https://example.awsapps.com/start".to_string(),
        region: "us-east-1".to_string(),
        account_id: "111122223333".to_string(),
        role_name: "Developer".to_string(),
        scopes: Vec::new(),
    })
}

fn role(name: &str, source: &str) -> ProfileDefinition {
    ProfileDefinition::new(name, BackendType::IamRoleChain)
        .with_role_arn(format!("arn:aws:iam::444455556666:role/{}", name))
        .with_source(source)
}

fn ctx() -> AssumeContext {
    AssumeContext::detached()
}

// ==================================================================================================
// Chain traversal and caching
// ==================================================================================================

#[tokio::test]
async fn test_two_hop_cold_resolution() {
    let harness = Harness::new();
    let resolver = harness.resolver(vec![base_sso(), role("dev", "base-sso")]);

    let bundle = resolver
        .resolve(&ctx(), "dev", ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(bundle.access_key_id, "ASIA-dev");
    assert_eq!(bundle.source_profile_name, "dev");
    assert_eq!(harness.called_profiles(), vec!["base-sso", "dev"]);
    assert_eq!(harness.writes(), 2);

    // Each hop after the root is authenticated by the previous hop
    let calls = harness.calls();
    assert_eq!(calls[0].parent_key, None);
    assert_eq!(calls[1].parent_key.as_deref(), Some("ASIA-base-sso"));
}

#[tokio::test]
async fn test_warm_cache_makes_no_calls() {
    let harness = Harness::new();
    let resolver = harness.resolver(vec![base_sso(), role("dev", "base-sso")]);

    let first = tokio_test::assert_ok!(
        resolver
            .resolve(&ctx(), "dev", ResolveOptions::default())
            .await
    );
    let calls_after_first = harness.calls().len();
    let second = tokio_test::assert_ok!(
        resolver
            .resolve(&ctx(), "dev", ResolveOptions::default())
            .await
    );

    assert_eq!(harness.calls().len(), calls_after_first);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_force_refresh_skips_cache_but_writes_back() {
    let harness = Harness::new();
    let resolver = harness.resolver(vec![base_sso(), role("dev", "base-sso")]);

    resolver
        .resolve(&ctx(), "dev", ResolveOptions::default())
        .await
        .unwrap();
    resolver
        .resolve(&ctx(), "dev", ResolveOptions { force_refresh: true })
        .await
        .unwrap();

    assert_eq!(
        harness.called_profiles(),
        vec!["base-sso", "dev", "base-sso", "dev"]
    );
    assert_eq!(harness.writes(), 4);
}

#[tokio::test]
async fn test_cached_root_feeds_next_hop() {
    let harness = Harness::new();
    let root = base_sso();
    harness.seed(&root, bundle_for("cached-root", Duration::hours(2)));
    let resolver = harness.resolver(vec![root, role("dev", "base-sso")]);

    resolver
        .resolve(&ctx(), "dev", ResolveOptions::default())
        .await
        .unwrap();

    let calls = harness.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].profile, "dev");
    assert_eq!(calls[0].parent_key.as_deref(), Some("ASIA-cached-root"));
    assert_eq!(harness.writes(), 1);
}

#[tokio::test]
async fn test_safety_margin() {
    // Within the 30 second margin: treated as a miss
    let harness = Harness::new();
    let root = base_sso();
    harness.seed(&root, bundle_for("base-sso", Duration::seconds(20)));
    let resolver = harness.resolver(vec![root]);
    resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(harness.called_profiles(), vec!["base-sso"]);

    // Comfortably beyond the margin: reused
    let harness = Harness::new();
    let root = base_sso();
    harness.seed(&root, bundle_for("base-sso", Duration::seconds(120)));
    let resolver = harness.resolver(vec![root]);
    resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap();
    assert!(harness.calls().is_empty());

    // Already expired: a miss
    let harness = Harness::new();
    let root = base_sso();
    harness.seed(&root, bundle_for("base-sso", Duration::seconds(-60)));
    let resolver = harness.resolver(vec![root]);
    resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(harness.calls().len(), 1);
}

#[tokio::test]
async fn test_corrupt_cache_file_does_not_block_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    std::fs::write(&path, vec![0xA5u8; 4096]).unwrap();

    let harness = Harness::on_disk(&path);
    let resolver = harness.resolver(vec![base_sso(), role("dev", "base-sso")]);

    let bundle = resolver
        .resolve(&ctx(), "dev", ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(bundle.access_key_id, "ASIA-dev");
    assert_eq!(harness.called_profiles(), vec!["base-sso", "dev"]);
}

#[tokio::test]
async fn test_sso_role_change_is_not_served_from_cache() {
    let harness = Harness::new();
    let original = base_sso();
    harness.seed(&original, bundle_for("old-role", Duration::hours(2)));

    let mut edited = base_sso();
    if let Some(sso) = edited.sso.as_mut() {
        sso.role_name = "Admin".to_string();
    }
    let resolver = harness.resolver(vec![edited]);

    let bundle = resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(bundle.access_key_id, "ASIA-base-sso");
    assert_eq!(harness.called_profiles(), vec!["base-sso"]);
}

// ==================================================================================================
// Configuration failures
// ==================================================================================================

#[tokio::test]
async fn test_cycle_fails_before_any_call() {
    let harness = Harness::new();
    let resolver = harness.resolver(vec![role("a", "b"), role("b", "c"), role("c", "a")]);

    let err = resolver
        .resolve(&ctx(), "a", ResolveOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        err.source.configuration_kind(),
        Some(ConfigurationKind::CyclicProfileChain)
    );
    assert_eq!(err.hop, 0);
    assert!(harness.calls().is_empty());
    assert_eq!(harness.writes(), 0);
}

#[tokio::test]
async fn test_unknown_source_profile() {
    let harness = Harness::new();
    let resolver = harness.resolver(vec![role("dev", "missing")]);

    let err = resolver
        .resolve(&ctx(), "dev", ResolveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.source.configuration_kind(),
        Some(ConfigurationKind::UnknownProfile)
    );
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn test_missing_assumer_fails_before_any_call() {
    let harness = Harness::new();
    let web = ProfileDefinition::new("web", BackendType::ExternalIdentityProvider)
        .with_role_arn("arn:aws:iam::444455556666:role/web");
    let resolver = harness.resolver(vec![base_sso(), web.with_source("base-sso")]);

    let err = resolver
        .resolve(&ctx(), "web", ResolveOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        err.source.configuration_kind(),
        Some(ConfigurationKind::NoAssumerForProfile)
    );
    assert_eq!(err.hop, 2);
    assert_eq!(err.backend, Some(BackendType::ExternalIdentityProvider));
    assert!(harness.calls().is_empty());
}

// ==================================================================================================
// Failure policy
// ==================================================================================================

#[tokio::test]
async fn test_no_access_mid_chain() {
    let harness = Harness::new();
    let root = base_sso();
    let mid = role("mid", "base-sso");
    let leaf = role("leaf", "mid");

    // A stale entry for the failing hop is present beforehand
    harness.seed(&mid, bundle_for("mid", Duration::seconds(-5)));
    harness.fail(
        "mid",
        vec![AssumeError::NoAccess {
            role_arn: "arn:aws:iam::444455556666:role/mid".to_string(),
            message: "not authorized".to_string(),
        }],
    );
    let resolver = harness.resolver(vec![root.clone(), mid.clone(), leaf]);

    let err = resolver
        .resolve(&ctx(), "leaf", ResolveOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.profile, "mid");
    assert_eq!(err.hop, 2);
    assert_eq!(err.backend, Some(BackendType::IamRoleChain));
    assert!(matches!(err.source, AssumeError::NoAccess { .. }));
    assert_eq!(harness.called_profiles(), vec!["base-sso", "mid"]);

    // Hop 1 stays cached, the failing hop's entry is gone
    assert!(harness
        .cache
        .get_credentials(&CacheKey::for_profile(&root))
        .is_some());
    assert!(harness.cache.get(&CacheKey::for_profile(&mid)).is_none());
}

#[tokio::test]
async fn test_expired_auth_retried_once_with_fresh_login() {
    let harness = Harness::new();
    harness.fail(
        "base-sso",
        vec![AssumeError::ExpiredAuth("token expired".to_string())],
    );
    let resolver = harness.resolver(vec![base_sso()]);

    resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap();

    let calls = harness.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].force_login);
    assert!(calls[1].force_login);
}

#[tokio::test]
async fn test_expired_auth_twice_fails_and_evicts() {
    let harness = Harness::new();
    let root = base_sso();
    harness.seed(&root, bundle_for("base-sso", Duration::seconds(10)));
    harness.fail(
        "base-sso",
        vec![
            AssumeError::ExpiredAuth("token expired".to_string()),
            AssumeError::ExpiredAuth("still expired".to_string()),
        ],
    );
    let resolver = harness.resolver(vec![root.clone()]);

    let err = resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err.source, AssumeError::ExpiredAuth(_)));
    assert_eq!(harness.calls().len(), 2);
    assert!(harness.cache.get(&CacheKey::for_profile(&root)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_back_off_then_succeed() {
    let harness = Harness::new();
    harness.fail(
        "base-sso",
        vec![
            AssumeError::Transient("connection reset".to_string()),
            AssumeError::Transient("503".to_string()),
        ],
    );
    let resolver = harness.resolver(vec![base_sso()]);

    let started = tokio::time::Instant::now();
    resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap();

    assert_eq!(harness.calls().len(), 3);
    // 1s then 2s with the default policy
    assert_eq!(started.elapsed().as_secs(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_surface_at_ceiling() {
    let harness = Harness::new();
    let attempts = BackoffPolicy::default().max_attempts as usize;
    harness.fail(
        "base-sso",
        (0..attempts + 2)
            .map(|i| AssumeError::Transient(format!("failure {}", i)))
            .collect(),
    );
    let resolver = harness.resolver(vec![base_sso()]);

    let err = resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap_err();

    assert!(err.source.is_transient());
    assert_eq!(harness.calls().len(), attempts);
    assert_eq!(harness.writes(), 0);
}

#[tokio::test]
async fn test_configuration_error_not_retried() {
    let harness = Harness::new();
    harness.fail(
        "base-sso",
        vec![AssumeError::invalid_profile("base-sso", "bad settings")],
    );
    let resolver = harness.resolver(vec![base_sso()]);

    let err = resolver
        .resolve(&ctx(), "base-sso", ResolveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.source.configuration_kind(),
        Some(ConfigurationKind::InvalidProfile)
    );
    assert_eq!(harness.calls().len(), 1);
}

#[tokio::test]
async fn test_cancelled_context_stops_resolution() {
    let harness = Harness::new();
    let resolver = harness.resolver(vec![base_sso(), role("dev", "base-sso")]);
    let ctx = ctx();
    ctx.cancel();

    let err = resolver
        .resolve(&ctx, "dev", ResolveOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err.source, AssumeError::Cancelled));
    assert!(harness.calls().is_empty());
    assert_eq!(harness.writes(), 0);
}
