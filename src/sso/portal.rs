// SSO portal: exchange an access token for role credentials

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};

use super::types::RoleCredentialsResponse;
use crate::assume::AssumeContext;
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, Result};
use crate::http_client::{is_retryable_status, parse_provider_error, transport_error};
use crate::profile::SsoSettings;

/// Role credentials lookup for an `(account_id, role_name)` pair
#[async_trait]
pub trait SsoPortal: Send + Sync {
    async fn get_role_credentials(
        &self,
        ctx: &AssumeContext,
        profile_name: &str,
        settings: &SsoSettings,
        access_token: &str,
    ) -> Result<CredentialBundle>;
}

/// Role ARN an SSO assignment maps to, used in access errors
pub fn role_arn(settings: &SsoSettings) -> String {
    format!(
        "arn:aws:iam::{}:role/{}",
        settings.account_id, settings.role_name
    )
}

pub struct HttpSsoPortal {
    client: Client,
    endpoint_override: Option<String>,
}

impl HttpSsoPortal {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint_override: None,
        }
    }

    pub fn with_endpoint(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint_override: Some(endpoint.into()),
        }
    }

    fn url(&self, region: &str) -> String {
        let base = match &self.endpoint_override {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://portal.sso.{}.amazonaws.com", region),
        };
        format!("{}/federation/credentials", base)
    }
}

#[async_trait]
impl SsoPortal for HttpSsoPortal {
    async fn get_role_credentials(
        &self,
        ctx: &AssumeContext,
        profile_name: &str,
        settings: &SsoSettings,
        access_token: &str,
    ) -> Result<CredentialBundle> {
        let url = self.url(&settings.region);
        tracing::debug!(
            url = %url,
            account_id = %settings.account_id,
            role_name = %settings.role_name,
            "Requesting SSO role credentials"
        );

        let (status, text) = ctx
            .run(async {
                let response = self
                    .client
                    .get(&url)
                    .query(&[
                        ("account_id", settings.account_id.as_str()),
                        ("role_name", settings.role_name.as_str()),
                    ])
                    .header("x-amz-sso_bearer_token", access_token)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, "GetRoleCredentials"))?;
                let status = response.status();
                let text = response
                    .text()
                    .await
                    .map_err(|e| transport_error(e, "GetRoleCredentials"))?;
                Ok((status, text))
            })
            .await?;

        if !status.is_success() {
            return Err(portal_error(status, &text, profile_name, settings));
        }

        let data: RoleCredentialsResponse = serde_json::from_str(&text).map_err(|e| {
            AssumeError::Transient(format!("invalid GetRoleCredentials response: {}", e))
        })?;
        let creds = data.role_credentials;
        let expires_at = Utc
            .timestamp_millis_opt(creds.expiration)
            .single()
            .ok_or_else(|| {
                AssumeError::Transient(format!(
                    "GetRoleCredentials returned an invalid expiration: {}",
                    creds.expiration
                ))
            })?;

        Ok(CredentialBundle {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.session_token,
            expires_at,
            source_profile_name: profile_name.to_string(),
        })
    }
}

fn portal_error(
    status: StatusCode,
    body: &str,
    profile_name: &str,
    settings: &SsoSettings,
) -> AssumeError {
    let message = parse_provider_error(body).describe(body);
    tracing::error!(status = %status, profile = profile_name, "SSO portal request failed: {}", message);

    match status {
        StatusCode::UNAUTHORIZED => AssumeError::ExpiredAuth(message),
        StatusCode::FORBIDDEN => AssumeError::NoAccess {
            role_arn: role_arn(settings),
            message,
        },
        s if is_retryable_status(s) => AssumeError::Transient(message),
        _ => AssumeError::invalid_profile(profile_name, message),
    }
}
