// SSO backend: device flow token exchanged for role credentials at the portal

use std::sync::Arc;

use async_trait::async_trait;

use super::context::AssumeContext;
use super::Assumer;
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, Result};
use crate::profile::{BackendType, ProfileDefinition};
use crate::sso::{SsoPortal, SsoTokenManager};

pub struct SsoAssumer {
    tokens: Arc<SsoTokenManager>,
    portal: Arc<dyn SsoPortal>,
}

impl SsoAssumer {
    pub fn new(tokens: Arc<SsoTokenManager>, portal: Arc<dyn SsoPortal>) -> Self {
        Self { tokens, portal }
    }
}

#[async_trait]
impl Assumer for SsoAssumer {
    fn backend_type(&self) -> BackendType {
        BackendType::SsoOidc
    }

    fn name(&self) -> &'static str {
        "sso"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn matches(&self, profile: &ProfileDefinition) -> bool {
        profile.sso.is_some()
    }

    async fn assume(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        _parent: Option<&CredentialBundle>,
    ) -> Result<CredentialBundle> {
        let settings = profile
            .sso
            .as_ref()
            .ok_or_else(|| AssumeError::invalid_profile(&profile.name, "missing [sso] settings"))?;

        let token = self.tokens.token(ctx, &profile.name, settings).await?;

        tracing::info!(
            profile = %profile.name,
            account_id = %settings.account_id,
            role_name = %settings.role_name,
            "Fetching SSO role credentials"
        );

        match self
            .portal
            .get_role_credentials(ctx, &profile.name, settings, &token.access_token)
            .await
        {
            Err(AssumeError::ExpiredAuth(message)) => {
                // The portal no longer accepts the token; the retry must log in again
                self.tokens.invalidate(&settings.start_url);
                Err(AssumeError::ExpiredAuth(message))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AesGcmSealer, CacheEntry, CacheKey, SecureCache};
    use crate::prompt::LogVerification;
    use crate::profile::SsoSettings;
    use crate::sso::client::OidcClient;
    use crate::sso::types::{
        ClientRegistration, DeviceAuthorization, PollOutcome, SsoToken, TokenGrant,
    };
    use crate::sso::FlowPolicy;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    struct NoOidc;

    #[async_trait]
    impl OidcClient for NoOidc {
        async fn register_client(
            &self,
            _ctx: &AssumeContext,
            _region: &str,
            _scopes: &[String],
        ) -> Result<ClientRegistration> {
            Err(AssumeError::Transient("offline".to_string()))
        }

        async fn start_device_authorization(
            &self,
            _ctx: &AssumeContext,
            _region: &str,
            _registration: &ClientRegistration,
            _start_url: &str,
        ) -> Result<DeviceAuthorization> {
            Err(AssumeError::Transient("offline".to_string()))
        }

        async fn create_token(
            &self,
            _ctx: &AssumeContext,
            _region: &str,
            _registration: &ClientRegistration,
            _device_code: &str,
        ) -> Result<PollOutcome> {
            Err(AssumeError::Transient("offline".to_string()))
        }

        async fn refresh_token(
            &self,
            _ctx: &AssumeContext,
            _region: &str,
            _registration: &ClientRegistration,
            _refresh_token: &str,
        ) -> Result<TokenGrant> {
            Err(AssumeError::Transient("offline".to_string()))
        }
    }

    struct ScriptedPortal {
        result: Mutex<Option<Result<CredentialBundle>>>,
        tokens_seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SsoPortal for ScriptedPortal {
        async fn get_role_credentials(
            &self,
            _ctx: &AssumeContext,
            _profile_name: &str,
            _settings: &SsoSettings,
            access_token: &str,
        ) -> Result<CredentialBundle> {
            self.tokens_seen.lock().unwrap().push(access_token.to_string());
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(AssumeError::Transient("no script".to_string())))
        }
    }

    fn settings() -> SsoSettings {
        SsoSettings {
            start_url: "https://example.awsapps.com/start".to_string(),
            region: "us-east-1".to_string(),
            account_id: "111122223333".to_string(),
            role_name: "Developer".to_string(),
            scopes: Vec::new(),
        }
    }

    fn setup(portal_result: Result<CredentialBundle>) -> (SsoAssumer, Arc<ScriptedPortal>, Arc<SecureCache>) {
        let sealer = AesGcmSealer::from_key_bytes(&[3u8; 32]).unwrap();
        let cache = Arc::new(SecureCache::in_memory(Arc::new(sealer)).unwrap());
        let now = Utc::now();
        cache
            .put(
                &CacheKey::for_sso_token(&settings().start_url),
                &CacheEntry::SsoToken(SsoToken {
                    access_token: "cached-access".to_string(),
                    refresh_token: None,
                    expires_at: now + Duration::hours(8),
                    issuer_url: settings().start_url,
                    region: "us-east-1".to_string(),
                    client_id: "client".to_string(),
                    client_secret: "secret".to_string(),
                    registration_expires_at: now + Duration::days(30),
                }),
            )
            .unwrap();

        let tokens = Arc::new(SsoTokenManager::new(
            Arc::new(NoOidc),
            Arc::new(LogVerification),
            cache.clone(),
            Duration::seconds(300),
            FlowPolicy::default(),
        ));
        let portal = Arc::new(ScriptedPortal {
            result: Mutex::new(Some(portal_result)),
            tokens_seen: Mutex::new(Vec::new()),
        });
        (SsoAssumer::new(tokens, portal.clone()), portal, cache)
    }

    fn profile() -> ProfileDefinition {
        ProfileDefinition::new("base-sso", BackendType::SsoOidc).with_sso(settings())
    }

    #[tokio::test]
    async fn test_cached_token_exchanged_at_portal() {
        let bundle = CredentialBundle {
            access_key_id: "ASIASSO".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("session".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
            source_profile_name: "base-sso".to_string(),
        };
        let (assumer, portal, _cache) = setup(Ok(bundle));

        let result = assumer
            .assume(&AssumeContext::detached(), &profile(), None)
            .await
            .unwrap();

        assert_eq!(result.access_key_id, "ASIASSO");
        assert_eq!(portal.tokens_seen.lock().unwrap()[0], "cached-access");
    }

    #[tokio::test]
    async fn test_portal_unauthorized_drops_token() {
        let (assumer, _portal, cache) =
            setup(Err(AssumeError::ExpiredAuth("Session token not found".to_string())));

        let err = assumer
            .assume(&AssumeContext::detached(), &profile(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AssumeError::ExpiredAuth(_)));
        assert!(cache
            .get_sso_token(&CacheKey::for_sso_token(&settings().start_url))
            .is_none());
    }

    #[tokio::test]
    async fn test_portal_forbidden_keeps_token() {
        let (assumer, _portal, cache) = setup(Err(AssumeError::NoAccess {
            role_arn: "arn:aws:iam::111122223333:role/Developer".to_string(),
            message: "No access".to_string(),
        }));

        let err = assumer
            .assume(&AssumeContext::detached(), &profile(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AssumeError::NoAccess { .. }));
        assert!(cache
            .get_sso_token(&CacheKey::for_sso_token(&settings().start_url))
            .is_some());
    }
}
