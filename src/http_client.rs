// Shared HTTP plumbing for backend calls
// Client construction, transport error classification, provider error parsing

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::AssumeError;

/// Build the HTTP client shared by every backend
pub fn build_client(connect_timeout: u64, request_timeout: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

/// Categorize a transport error for logging
pub fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Map a transport failure onto the taxonomy; every transport failure is transient
pub fn transport_error(e: reqwest::Error, operation: &str) -> AssumeError {
    let kind = error_kind(&e);
    tracing::warn!(
        error_kind = kind,
        error = %e,
        operation = operation,
        "HTTP request error"
    );
    AssumeError::Transient(format!("{} failed: {} (kind: {})", operation, e, kind))
}

/// Statuses worth retrying with backoff
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Error code and message extracted from a provider error body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderError {
    pub code: Option<String>,
    pub message: Option<String>,
}

impl ProviderError {
    /// Message for the user, falling back to the raw body
    pub fn describe(&self, body: &str) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => body.to_string(),
        }
    }
}

/// Parse the error shapes returned by OIDC, SSO portal and STS endpoints
///
/// - OAuth style: `{"error": "...", "error_description": "..."}`
/// - REST JSON style: `{"__type": "...", "message": "..."}`
/// - STS query style: `{"Error": {"Code": "...", "Message": "..."}}`
pub fn parse_provider_error(body: &str) -> ProviderError {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return ProviderError::default();
    };

    let text = |value: Option<&serde_json::Value>| {
        value.and_then(|v| v.as_str()).map(str::to_string)
    };

    if let Some(error) = json.get("Error") {
        return ProviderError {
            code: text(error.get("Code")),
            message: text(error.get("Message")),
        };
    }

    let code = text(json.get("error")).or_else(|| {
        // "__type" may carry a namespace prefix: "com.amazonaws...#UnauthorizedException"
        text(json.get("__type")).map(|t| t.rsplit('#').next().unwrap_or(&t).to_string())
    });
    let message = text(json.get("error_description"))
        .or_else(|| text(json.get("message")))
        .or_else(|| text(json.get("Message")));

    ProviderError { code, message }
}

/// First characters of a secret, safe for logs
pub fn secret_prefix(secret: &str) -> &str {
    let end = secret
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(secret.len());
    &secret[..end]
}
