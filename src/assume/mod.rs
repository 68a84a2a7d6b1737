// Assumer backends and the registry that selects between them

pub mod backoff;
pub mod context;
pub mod iam;
pub mod process;
pub mod sigv4;
pub mod sso;
pub mod sts;
pub mod web_identity;

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, ConfigurationKind, Result};
use crate::profile::{BackendType, ProfileDefinition};
use crate::prompt::MfaPrompt;
use crate::sso::{SsoPortal, SsoTokenManager};

pub use backoff::BackoffPolicy;
pub use context::AssumeContext;

/// A backend able to produce credentials for one profile
#[async_trait]
pub trait Assumer: Send + Sync {
    /// Backend this assumer serves
    fn backend_type(&self) -> BackendType;

    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Higher priority assumers are consulted first
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this assumer accepts the profile (backend already matched)
    fn matches(&self, _profile: &ProfileDefinition) -> bool {
        true
    }

    /// Produce credentials for `profile`, authenticated by `parent` when chained
    async fn assume(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        parent: Option<&CredentialBundle>,
    ) -> Result<CredentialBundle>;
}

/// Priority ordered set of assumers
#[derive(Default, Clone)]
pub struct AssumerRegistry {
    assumers: Vec<Arc<dyn Assumer>>,
}

impl AssumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an assumer; equal priorities keep registration order
    pub fn register(&mut self, assumer: Arc<dyn Assumer>) {
        self.assumers.push(assumer);
        self.assumers
            .sort_by_key(|a| std::cmp::Reverse(a.priority()));
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, assumer: Arc<dyn Assumer>) -> Self {
        self.register(assumer);
        self
    }

    pub fn len(&self) -> usize {
        self.assumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assumers.is_empty()
    }

    /// Highest priority assumer serving the profile's backend and accepting it
    pub fn select(&self, profile: &ProfileDefinition) -> Result<Arc<dyn Assumer>> {
        self.assumers
            .iter()
            .find(|a| a.backend_type() == profile.backend_type && a.matches(profile))
            .cloned()
            .ok_or_else(|| {
                AssumeError::configuration(
                    ConfigurationKind::NoAssumerForProfile,
                    &profile.name,
                    format!("no assumer registered for backend {}", profile.backend_type),
                )
            })
    }
}

/// Registry with every shipped backend
pub fn default_registry(
    sts: Arc<dyn sts::StsApi>,
    mfa: Arc<dyn MfaPrompt>,
    sso_tokens: Arc<SsoTokenManager>,
    portal: Arc<dyn SsoPortal>,
) -> AssumerRegistry {
    AssumerRegistry::new()
        .with(Arc::new(sso::SsoAssumer::new(sso_tokens, portal)))
        .with(Arc::new(iam::RoleAssumer::with_mfa(sts.clone(), mfa)))
        .with(Arc::new(iam::RoleAssumer::new(sts.clone())))
        .with(Arc::new(process::ProcessAssumer::new()))
        .with(Arc::new(web_identity::WebIdentityAssumer::new(sts)))
}

impl std::fmt::Debug for AssumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.assumers.iter().map(|a| (a.name(), a.priority())))
            .finish()
    }
}
