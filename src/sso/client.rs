// SSO OIDC client: client registration, device authorization, token endpoint

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{
    ClientRegistration, CreateTokenRequest, CreateTokenResponse, DeviceAuthorization, PollOutcome,
    RegisterClientRequest, RegisterClientResponse, StartDeviceAuthorizationRequest,
    StartDeviceAuthorizationResponse, TokenGrant,
};
use crate::assume::AssumeContext;
use crate::error::{AssumeError, Result};
use crate::http_client::{
    is_retryable_status, parse_provider_error, secret_prefix, transport_error,
};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_GRANT: &str = "refresh_token";

/// Lifetime assumed for a registration when the provider omits it
const DEFAULT_REGISTRATION_DAYS: i64 = 90;

/// Device code lifetime assumed when the provider omits it
const DEFAULT_DEVICE_CODE_SECS: u64 = 600;

/// Access token lifetime assumed when the provider omits it
const DEFAULT_TOKEN_SECS: u64 = 3600;

/// OIDC operations used by the device flow and token refresh
#[async_trait]
pub trait OidcClient: Send + Sync {
    async fn register_client(
        &self,
        ctx: &AssumeContext,
        region: &str,
        scopes: &[String],
    ) -> Result<ClientRegistration>;

    async fn start_device_authorization(
        &self,
        ctx: &AssumeContext,
        region: &str,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceAuthorization>;

    /// One poll of the token endpoint with the device code
    async fn create_token(
        &self,
        ctx: &AssumeContext,
        region: &str,
        registration: &ClientRegistration,
        device_code: &str,
    ) -> Result<PollOutcome>;

    /// Exchange a refresh token; an unrecoverable refusal is `ExpiredAuth`
    async fn refresh_token(
        &self,
        ctx: &AssumeContext,
        region: &str,
        registration: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<TokenGrant>;
}

/// OIDC JSON API over HTTPS
pub struct HttpOidcClient {
    client: Client,
    client_name: String,
    endpoint_override: Option<String>,
}

impl HttpOidcClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            endpoint_override: None,
        }
    }

    /// Send every request to `endpoint` instead of the regional OIDC host
    pub fn with_endpoint(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint_override: Some(endpoint.into()),
            ..Self::new(client)
        }
    }

    fn url(&self, region: &str, path: &str) -> String {
        match &self.endpoint_override {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), path),
            None => format!("https://oidc.{}.amazonaws.com{}", region, path),
        }
    }

    /// POST a JSON body, returning the status and raw response text
    async fn post<B: Serialize + Sync>(
        &self,
        ctx: &AssumeContext,
        url: &str,
        body: &B,
        operation: &str,
    ) -> Result<(StatusCode, String)> {
        ctx.run(async {
            let response = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await
                .map_err(|e| transport_error(e, operation))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| transport_error(e, operation))?;
            Ok((status, text))
        })
        .await
    }
}

fn decode<T: DeserializeOwned>(text: &str, operation: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| AssumeError::Transient(format!("invalid {} response: {}", operation, e)))
}

/// Errors from registration or device authorization
fn setup_error(status: StatusCode, body: &str, operation: &str, subject: &str) -> AssumeError {
    let message = parse_provider_error(body).describe(body);
    tracing::error!(status = %status, operation = operation, "SSO OIDC request failed: {}", message);
    if is_retryable_status(status) {
        AssumeError::Transient(format!("{}: {}", operation, message))
    } else {
        AssumeError::invalid_profile(subject, format!("{} rejected: {}", operation, message))
    }
}

/// Classify a token endpoint error body into a poll outcome, if it is one
fn poll_outcome(code: &str) -> Option<PollOutcome> {
    match code {
        "authorization_pending" | "AuthorizationPendingException" => Some(PollOutcome::Pending),
        "slow_down" | "SlowDownException" => Some(PollOutcome::SlowDown),
        "access_denied" | "AccessDeniedException" => Some(PollOutcome::Denied),
        "expired_token" | "ExpiredTokenException" => Some(PollOutcome::Expired),
        _ => None,
    }
}

fn grant_from(response: CreateTokenResponse) -> TokenGrant {
    TokenGrant {
        access_token: response.access_token,
        refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
        expires_in: response.expires_in.unwrap_or(DEFAULT_TOKEN_SECS),
    }
}

#[async_trait]
impl OidcClient for HttpOidcClient {
    async fn register_client(
        &self,
        ctx: &AssumeContext,
        region: &str,
        scopes: &[String],
    ) -> Result<ClientRegistration> {
        let url = self.url(region, "/client/register");
        tracing::debug!(url = %url, "Registering SSO OIDC client");

        let request = RegisterClientRequest {
            client_name: &self.client_name,
            client_type: "public",
            scopes,
        };
        let (status, text) = self.post(ctx, &url, &request, "RegisterClient").await?;
        if !status.is_success() {
            return Err(setup_error(status, &text, "RegisterClient", region));
        }

        let data: RegisterClientResponse = decode(&text, "RegisterClient")?;
        let expires_at = data
            .client_secret_expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(|| Utc::now() + Duration::days(DEFAULT_REGISTRATION_DAYS));

        tracing::info!(
            "Registered SSO OIDC client {}..., expires: {}",
            secret_prefix(&data.client_id),
            expires_at.to_rfc3339()
        );

        Ok(ClientRegistration {
            client_id: data.client_id,
            client_secret: data.client_secret,
            expires_at,
        })
    }

    async fn start_device_authorization(
        &self,
        ctx: &AssumeContext,
        region: &str,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceAuthorization> {
        let url = self.url(region, "/device_authorization");
        let request = StartDeviceAuthorizationRequest {
            client_id: &registration.client_id,
            client_secret: &registration.client_secret,
            start_url,
        };
        let (status, text) = self
            .post(ctx, &url, &request, "StartDeviceAuthorization")
            .await?;
        if !status.is_success() {
            return Err(setup_error(
                status,
                &text,
                "StartDeviceAuthorization",
                start_url,
            ));
        }

        let data: StartDeviceAuthorizationResponse = decode(&text, "StartDeviceAuthorization")?;
        Ok(DeviceAuthorization {
            device_code: data.device_code,
            user_code: data.user_code,
            verification_uri: data.verification_uri,
            verification_uri_complete: data.verification_uri_complete,
            expires_in: data.expires_in.unwrap_or(DEFAULT_DEVICE_CODE_SECS),
            interval: data.interval,
        })
    }

    async fn create_token(
        &self,
        ctx: &AssumeContext,
        region: &str,
        registration: &ClientRegistration,
        device_code: &str,
    ) -> Result<PollOutcome> {
        let url = self.url(region, "/token");
        let request = CreateTokenRequest {
            client_id: &registration.client_id,
            client_secret: &registration.client_secret,
            grant_type: DEVICE_CODE_GRANT,
            device_code: Some(device_code),
            refresh_token: None,
        };
        let (status, text) = self.post(ctx, &url, &request, "CreateToken").await?;

        if status.is_success() {
            let data: CreateTokenResponse = decode(&text, "CreateToken")?;
            return Ok(PollOutcome::Granted(grant_from(data)));
        }

        let provider = parse_provider_error(&text);
        if let Some(outcome) = provider.code.as_deref().and_then(poll_outcome) {
            return Ok(outcome);
        }

        let message = provider.describe(&text);
        if is_retryable_status(status) {
            Err(AssumeError::Transient(format!("CreateToken: {}", message)))
        } else {
            // invalid_client / invalid_grant: the registration or device code is unusable
            Err(AssumeError::ExpiredAuth(format!("CreateToken: {}", message)))
        }
    }

    async fn refresh_token(
        &self,
        ctx: &AssumeContext,
        region: &str,
        registration: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<TokenGrant> {
        let url = self.url(region, "/token");
        tracing::debug!(
            "SSO OIDC refresh request: url={}, client_id={}...",
            url,
            secret_prefix(&registration.client_id)
        );

        let request = CreateTokenRequest {
            client_id: &registration.client_id,
            client_secret: &registration.client_secret,
            grant_type: REFRESH_GRANT,
            device_code: None,
            refresh_token: Some(refresh_token),
        };
        let (status, text) = self.post(ctx, &url, &request, "RefreshToken").await?;

        if !status.is_success() {
            let message = parse_provider_error(&text).describe(&text);
            tracing::error!(status = %status, "SSO OIDC refresh failed: {}", message);
            return Err(if is_retryable_status(status) {
                AssumeError::Transient(format!("RefreshToken: {}", message))
            } else {
                AssumeError::ExpiredAuth(format!("RefreshToken: {}", message))
            });
        }

        let data: CreateTokenResponse = decode(&text, "RefreshToken")?;
        if data.access_token.is_empty() {
            return Err(AssumeError::Transient(
                "RefreshToken response does not contain accessToken".to_string(),
            ));
        }
        Ok(grant_from(data))
    }
}
