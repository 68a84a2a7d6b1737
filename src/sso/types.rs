// SSO OIDC types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest lifetime accepted from the provider for device codes and access tokens
pub const MAX_PROVIDER_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;

/// Provider reported lifetime, capped at [`MAX_PROVIDER_LIFETIME_SECS`]
pub fn bounded_lifetime_secs(expires_in: u64) -> u64 {
    expires_in.min(MAX_PROVIDER_LIFETIME_SECS)
}

/// Long-lived login artifact produced by the device authorization flow
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsoToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,

    /// Portal start URL the token was issued for
    pub issuer_url: String,

    /// Region hosting the OIDC endpoints
    pub region: String,

    // Client registration artifacts
    pub client_id: String,
    pub client_secret: String,
    pub registration_expires_at: DateTime<Utc>,
}

impl SsoToken {
    /// Access token usable for longer than `grace` after `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.expires_at - grace > now
    }

    /// Access token not yet expired
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// A refresh token exists and the client registration backing it is still valid
    pub fn can_refresh(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some() && self.registration_expires_at > now
    }

    /// Client registration, reusable for a fresh device flow while unexpired
    pub fn registration(&self) -> ClientRegistration {
        ClientRegistration {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            expires_at: self.registration_expires_at,
        }
    }
}

impl fmt::Debug for SsoToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoToken")
            .field("access_token", &"** redacted **")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "** redacted **"),
            )
            .field("expires_at", &self.expires_at)
            .field("issuer_url", &self.issuer_url)
            .field("region", &self.region)
            .field("client_id", &self.client_id)
            .field("client_secret", &"** redacted **")
            .field("registration_expires_at", &self.registration_expires_at)
            .finish()
    }
}

/// Registered public OIDC client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub expires_at: DateTime<Utc>,
}

impl ClientRegistration {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Device code and the verification details shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,

    /// Device code lifetime in seconds
    pub expires_in: u64,

    /// Provider requested polling interval in seconds
    pub interval: Option<u64>,
}

impl DeviceAuthorization {
    /// URL to open, preferring the one with the user code embedded
    pub fn url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

/// Tokens issued by the token endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"** redacted **")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Result of one poll of the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// `authorization_pending`
    Pending,

    /// `slow_down`
    SlowDown,

    /// Token issued
    Granted(TokenGrant),

    /// `access_denied`
    Denied,

    /// `expired_token`
    Expired,
}

/// Device authorization state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlowState {
    Idle,
    AuthorizationRequested,
    PollingForToken,
    Authenticated,
    Denied,
    Expired,
}

impl DeviceFlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceFlowState::Authenticated | DeviceFlowState::Denied | DeviceFlowState::Expired
        )
    }
}

// Wire types for the OIDC JSON API

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientRequest<'a> {
    pub client_name: &'a str,
    pub client_type: &'a str,
    #[serde(skip_serializing_if = "no_scopes")]
    pub scopes: &'a [String],
}

fn no_scopes(scopes: &&[String]) -> bool {
    scopes.is_empty()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientResponse {
    pub client_id: String,
    pub client_secret: String,
    pub client_secret_expires_at: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeviceAuthorizationRequest<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub start_url: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in: Option<u64>,
    pub interval: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenRequest<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// SSO portal GetRoleCredentials response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCredentialsResponse {
    pub role_credentials: RoleCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,

    /// Milliseconds since the epoch
    pub expiration: i64,
}
