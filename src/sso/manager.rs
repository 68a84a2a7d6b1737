// SSO token lifecycle: cache lookup, silent refresh, device flow login

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::client::OidcClient;
use super::flow::{DeviceFlow, FlowPolicy};
use super::types::{bounded_lifetime_secs, ClientRegistration, SsoToken, TokenGrant};
use crate::assume::AssumeContext;
use crate::cache::{CacheEntry, CacheKey, SecureCache};
use crate::error::{AssumeError, Result};
use crate::profile::SsoSettings;
use crate::prompt::VerificationPrompt;

/// Provides a usable SSO access token for a start URL
pub struct SsoTokenManager {
    oidc: Arc<dyn OidcClient>,
    prompt: Arc<dyn VerificationPrompt>,
    cache: Arc<SecureCache>,

    /// Tokens expiring within this window are refreshed ahead of time
    refresh_grace: Duration,

    flow_policy: FlowPolicy,
}

impl SsoTokenManager {
    pub fn new(
        oidc: Arc<dyn OidcClient>,
        prompt: Arc<dyn VerificationPrompt>,
        cache: Arc<SecureCache>,
        refresh_grace: Duration,
        flow_policy: FlowPolicy,
    ) -> Self {
        Self {
            oidc,
            prompt,
            cache,
            refresh_grace,
            flow_policy,
        }
    }

    /// Cached, refreshed, or freshly authorized token for `settings.start_url`
    pub async fn token(
        &self,
        ctx: &AssumeContext,
        profile_name: &str,
        settings: &SsoSettings,
    ) -> Result<SsoToken> {
        let key = CacheKey::for_sso_token(&settings.start_url);
        let cached = self.cache.get_sso_token(&key);
        let now = Utc::now();

        if let Some(token) = cached.as_ref().filter(|_| !ctx.force_login()) {
            if token.is_fresh(now, self.refresh_grace) {
                tracing::debug!(profile = profile_name, "Using cached SSO token");
                return Ok(token.clone());
            }

            if token.can_refresh(now) {
                match self.refresh(ctx, token).await {
                    Ok(refreshed) => {
                        self.store(&key, &refreshed);
                        return Ok(refreshed);
                    }
                    Err(AssumeError::Cancelled) => return Err(AssumeError::Cancelled),
                    Err(e) if e.is_transient() => {
                        if token.is_usable(now) {
                            tracing::warn!(
                                "SSO token refresh failed, using token valid until {}: {}",
                                token.expires_at.to_rfc3339(),
                                e
                            );
                            return Ok(token.clone());
                        }
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!("SSO token refresh rejected, logging in again: {}", e);
                        self.invalidate(&settings.start_url);
                    }
                }
            } else if token.is_usable(now) {
                tracing::debug!(
                    profile = profile_name,
                    "SSO token near expiry and not refreshable, using it until {}",
                    token.expires_at.to_rfc3339()
                );
                return Ok(token.clone());
            }
        }

        // A still valid registration is reused even for a forced login
        let registration = cached
            .as_ref()
            .map(SsoToken::registration)
            .filter(|r| r.is_valid_at(now));

        self.login(ctx, profile_name, settings, registration, &key)
            .await
    }

    /// Remove the cached token so the next call runs the device flow
    pub fn invalidate(&self, start_url: &str) {
        let key = CacheKey::for_sso_token(start_url);
        if let Err(e) = self.cache.delete(&key) {
            tracing::warn!(key = %key, "Failed to delete SSO token: {}", e);
        }
    }

    async fn refresh(&self, ctx: &AssumeContext, token: &SsoToken) -> Result<SsoToken> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or_else(|| AssumeError::ExpiredAuth("no refresh token".to_string()))?;

        tracing::info!(issuer = %token.issuer_url, "Refreshing SSO token");
        let grant = self
            .oidc
            .refresh_token(ctx, &token.region, &token.registration(), refresh_token)
            .await?;

        let mut refreshed = token_from_grant(
            grant,
            &token.issuer_url,
            &token.region,
            &token.registration(),
            Utc::now(),
        );
        // Some providers do not rotate refresh tokens
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = token.refresh_token.clone();
        }

        tracing::info!(
            "SSO token refreshed, expires: {}",
            refreshed.expires_at.to_rfc3339()
        );
        Ok(refreshed)
    }

    async fn login(
        &self,
        ctx: &AssumeContext,
        profile_name: &str,
        settings: &SsoSettings,
        registration: Option<ClientRegistration>,
        key: &CacheKey,
    ) -> Result<SsoToken> {
        let registration = match registration {
            Some(registration) => registration,
            None => self
                .oidc
                .register_client(ctx, &settings.region, &settings.scopes)
                .await
                .map_err(|e| e.with_profile(profile_name))?,
        };

        tracing::info!(
            profile = profile_name,
            start_url = %settings.start_url,
            "Starting SSO device authorization"
        );

        let mut flow = DeviceFlow::new(self.oidc.clone(), self.prompt.clone(), self.flow_policy);
        let grant = flow
            .authorize(ctx, settings, &registration)
            .await
            .map_err(|e| e.with_profile(profile_name))?;

        let token = token_from_grant(
            grant,
            &settings.start_url,
            &settings.region,
            &registration,
            Utc::now(),
        );
        self.store(key, &token);
        Ok(token)
    }

    fn store(&self, key: &CacheKey, token: &SsoToken) {
        if let Err(e) = self.cache.put(key, &CacheEntry::SsoToken(token.clone())) {
            tracing::warn!(key = %key, "Failed to cache SSO token: {}", e);
        }
    }
}

fn token_from_grant(
    grant: TokenGrant,
    issuer_url: &str,
    region: &str,
    registration: &ClientRegistration,
    now: DateTime<Utc>,
) -> SsoToken {
    SsoToken {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        expires_at: now + Duration::seconds(bounded_lifetime_secs(grant.expires_in) as i64),
        issuer_url: issuer_url.to_string(),
        region: region.to_string(),
        client_id: registration.client_id.clone(),
        client_secret: registration.client_secret.clone(),
        registration_expires_at: registration.expires_at,
    }
}
