// STS client used by the IAM and web identity assumers

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};

use super::context::AssumeContext;
use super::sigv4::{self, SignableRequest, SigningCredentials};
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, Result};
use crate::http_client::{is_retryable_status, parse_provider_error, transport_error};

const STS_VERSION: &str = "2011-06-15";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Parameters for AssumeRole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub duration_seconds: Option<u32>,
    pub mfa: Option<MfaToken>,
}

/// MFA device serial and the code read from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaToken {
    pub serial: String,
    pub code: String,
}

/// Parameters for AssumeRoleWithWebIdentity
#[derive(Clone, PartialEq, Eq)]
pub struct WebIdentityRequest {
    pub role_arn: String,
    pub session_name: String,
    pub duration_seconds: Option<u32>,
    pub token: String,
}

impl std::fmt::Debug for WebIdentityRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebIdentityRequest")
            .field("role_arn", &self.role_arn)
            .field("session_name", &self.session_name)
            .field("duration_seconds", &self.duration_seconds)
            .field("token", &"** redacted **")
            .finish()
    }
}

/// Temporary credentials returned by STS
#[derive(Clone, PartialEq, Eq)]
pub struct StsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for StsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &"** redacted **")
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl StsCredentials {
    pub fn into_bundle(self, profile_name: &str) -> CredentialBundle {
        CredentialBundle {
            access_key_id: self.access_key_id,
            secret_access_key: self.secret_access_key,
            session_token: Some(self.session_token),
            expires_at: self.expiration,
            source_profile_name: profile_name.to_string(),
        }
    }
}

/// STS operations needed for role chaining
#[async_trait]
pub trait StsApi: Send + Sync {
    async fn assume_role(
        &self,
        ctx: &AssumeContext,
        creds: &SigningCredentials,
        region: &str,
        request: &AssumeRoleRequest,
    ) -> Result<StsCredentials>;

    async fn assume_role_with_web_identity(
        &self,
        ctx: &AssumeContext,
        region: &str,
        request: &WebIdentityRequest,
    ) -> Result<StsCredentials>;
}

/// Credentials to sign with, taken from a parent bundle
impl From<&CredentialBundle> for SigningCredentials {
    fn from(bundle: &CredentialBundle) -> Self {
        Self {
            access_key_id: bundle.access_key_id.clone(),
            secret_access_key: bundle.secret_access_key.clone(),
            session_token: bundle.session_token.clone(),
        }
    }
}

/// Long-lived or ambient credentials from `AWS_ACCESS_KEY_ID` and friends
pub fn signing_credentials_from_env() -> Option<SigningCredentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    if access_key_id.is_empty() || secret_access_key.is_empty() {
        return None;
    }
    Some(SigningCredentials {
        access_key_id,
        secret_access_key,
        session_token: std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty()),
    })
}

/// Default role session name: `<prefix>-<hostname>-<unix seconds>`, limited to STS rules
pub fn default_session_name(prefix: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let raw = format!("{}-{}-{}", prefix, host, Utc::now().timestamp());
    sanitize_session_name(&raw)
}

/// Keep only characters STS accepts (`[\w+=,.@-]`) and at most 64 of them
pub fn sanitize_session_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_+=,.@-".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect()
}

/// STS query API over HTTPS with JSON responses
pub struct HttpStsClient {
    client: Client,
    endpoint_override: Option<String>,
}

impl HttpStsClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint_override: None,
        }
    }

    /// Send every request to `endpoint` instead of the regional STS host
    pub fn with_endpoint(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint_override: Some(endpoint.into()),
        }
    }

    fn endpoint(&self, region: &str) -> String {
        match &self.endpoint_override {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://sts.{}.amazonaws.com/", region),
        }
    }

    async fn call(
        &self,
        ctx: &AssumeContext,
        region: &str,
        role_arn: &str,
        action: &str,
        body: String,
        signer: Option<&SigningCredentials>,
    ) -> Result<StsCredentials> {
        let url = self.endpoint(region);
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| AssumeError::Transient(format!("invalid STS endpoint {}: {}", url, e)))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AssumeError::Transient(format!(
                    "STS endpoint has no host: {}",
                    url
                )))
            }
        };

        let mut builder = self
            .client
            .post(parsed.clone())
            .header("Content-Type", FORM_CONTENT_TYPE)
            .header("Accept", "application/json");

        if let Some(creds) = signer {
            let signed = sigv4::sign(
                creds,
                region,
                "sts",
                &SignableRequest {
                    method: "POST",
                    host: &host,
                    path: parsed.path(),
                    content_type: Some(FORM_CONTENT_TYPE),
                    body: body.as_bytes(),
                },
                Utc::now(),
            )
            .map_err(|e| AssumeError::invalid_profile(role_arn, format!("signing failed: {}", e)))?;
            builder = builder
                .header("Authorization", signed.authorization)
                .header("X-Amz-Date", signed.amz_date);
            if let Some(token) = signed.security_token {
                builder = builder.header("X-Amz-Security-Token", token);
            }
        }

        tracing::debug!(action = action, role_arn = role_arn, url = %url, "Calling STS");

        let response = ctx
            .run(async {
                builder
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| transport_error(e, action))
            })
            .await?;

        let status = response.status();
        let text = ctx
            .run(async {
                response
                    .text()
                    .await
                    .map_err(|e| transport_error(e, action))
            })
            .await?;

        if !status.is_success() {
            return Err(map_sts_error(status, &text, role_arn));
        }

        parse_sts_credentials(action, &text)
    }
}

#[async_trait]
impl StsApi for HttpStsClient {
    async fn assume_role(
        &self,
        ctx: &AssumeContext,
        creds: &SigningCredentials,
        region: &str,
        request: &AssumeRoleRequest,
    ) -> Result<StsCredentials> {
        let mut params: Vec<(&str, String)> = vec![
            ("Action", "AssumeRole".to_string()),
            ("Version", STS_VERSION.to_string()),
            ("RoleArn", request.role_arn.clone()),
            ("RoleSessionName", request.session_name.clone()),
        ];
        if let Some(duration) = request.duration_seconds {
            params.push(("DurationSeconds", duration.to_string()));
        }
        if let Some(mfa) = &request.mfa {
            params.push(("SerialNumber", mfa.serial.clone()));
            params.push(("TokenCode", mfa.code.clone()));
        }

        self.call(
            ctx,
            region,
            &request.role_arn,
            "AssumeRole",
            encode_form(&params),
            Some(creds),
        )
        .await
    }

    async fn assume_role_with_web_identity(
        &self,
        ctx: &AssumeContext,
        region: &str,
        request: &WebIdentityRequest,
    ) -> Result<StsCredentials> {
        let mut params: Vec<(&str, String)> = vec![
            ("Action", "AssumeRoleWithWebIdentity".to_string()),
            ("Version", STS_VERSION.to_string()),
            ("RoleArn", request.role_arn.clone()),
            ("RoleSessionName", request.session_name.clone()),
            ("WebIdentityToken", request.token.clone()),
        ];
        if let Some(duration) = request.duration_seconds {
            params.push(("DurationSeconds", duration.to_string()));
        }

        // Web identity exchange is unsigned
        self.call(
            ctx,
            region,
            &request.role_arn,
            "AssumeRoleWithWebIdentity",
            encode_form(&params),
            None,
        )
        .await
    }
}

fn encode_form(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Map an STS error response onto the taxonomy
pub fn map_sts_error(status: StatusCode, body: &str, role_arn: &str) -> AssumeError {
    let provider = parse_provider_error(body);
    let message = provider.describe(body);
    tracing::error!(status = %status, role_arn = role_arn, "STS request failed: {}", message);

    match provider.code.as_deref() {
        Some("AccessDenied") | Some("AccessDeniedException") | Some("InvalidIdentityToken") => {
            AssumeError::NoAccess {
                role_arn: role_arn.to_string(),
                message,
            }
        }
        Some("ExpiredToken") | Some("ExpiredTokenException") | Some("InvalidClientTokenId")
        | Some("TokenRefreshRequired") => AssumeError::ExpiredAuth(message),
        Some("Throttling") | Some("ThrottlingException") | Some("IDPCommunicationError")
        | Some("RequestLimitExceeded") => AssumeError::Transient(message),
        _ if is_retryable_status(status) => AssumeError::Transient(message),
        _ if status == StatusCode::FORBIDDEN => AssumeError::NoAccess {
            role_arn: role_arn.to_string(),
            message,
        },
        _ => AssumeError::invalid_profile(role_arn, message),
    }
}

/// Extract `<Action>Response.<Action>Result.Credentials` from a JSON response
fn parse_sts_credentials(action: &str, body: &str) -> Result<StsCredentials> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AssumeError::Transient(format!("invalid {} response: {}", action, e)))?;

    let creds = json
        .get(format!("{}Response", action))
        .and_then(|v| v.get(format!("{}Result", action)))
        .and_then(|v| v.get("Credentials"))
        .ok_or_else(|| {
            AssumeError::Transient(format!("{} response has no Credentials", action))
        })?;

    let field = |name: &str| {
        creds
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                AssumeError::Transient(format!("{} response is missing {}", action, name))
            })
    };

    let expiration = creds
        .get("Expiration")
        .and_then(parse_expiration)
        .ok_or_else(|| {
            AssumeError::Transient(format!("{} response has no valid Expiration", action))
        })?;

    Ok(StsCredentials {
        access_key_id: field("AccessKeyId")?,
        secret_access_key: field("SecretAccessKey")?,
        session_token: field("SessionToken")?,
        expiration,
    })
}

/// STS JSON encodes timestamps as epoch seconds; accept RFC 3339 strings as well
fn parse_expiration(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    if let Some(seconds) = value.as_f64() {
        return Utc.timestamp_opt(seconds as i64, 0).single();
    }
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
