// External credential process backend

use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::process::Command;

use super::context::AssumeContext;
use super::Assumer;
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, Result};
use crate::profile::{BackendType, ProfileDefinition};

/// Lifetime given to credentials printed without an `Expiration`
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Document printed by a credential process on stdout
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessOutput {
    version: u32,
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

/// Runs `credential_process` through the shell and parses its JSON output
#[derive(Debug, Default)]
pub struct ProcessAssumer;

impl ProcessAssumer {
    pub fn new() -> Self {
        Self
    }

    fn command(command_line: &str, parent: Option<&CredentialBundle>) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // A chained process sees the parent hop's credentials
        if let Some(bundle) = parent {
            command
                .env("AWS_ACCESS_KEY_ID", &bundle.access_key_id)
                .env("AWS_SECRET_ACCESS_KEY", &bundle.secret_access_key);
            match &bundle.session_token {
                Some(token) => command.env("AWS_SESSION_TOKEN", token),
                None => command.env_remove("AWS_SESSION_TOKEN"),
            };
        }
        command
    }
}

#[async_trait]
impl Assumer for ProcessAssumer {
    fn backend_type(&self) -> BackendType {
        BackendType::CredentialProcess
    }

    fn name(&self) -> &'static str {
        "credential-process"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn assume(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        parent: Option<&CredentialBundle>,
    ) -> Result<CredentialBundle> {
        let command_line = profile.credential_process.as_deref().ok_or_else(|| {
            AssumeError::invalid_profile(&profile.name, "credential_process is required")
        })?;

        tracing::info!(profile = %profile.name, "Running credential process");

        let child = Self::command(command_line, parent).spawn().map_err(|e| {
            AssumeError::invalid_profile(
                &profile.name,
                format!("failed to start credential process: {}", e),
            )
        })?;

        let output = ctx
            .run(async {
                child.wait_with_output().await.map_err(|e| {
                    AssumeError::Transient(format!("credential process I/O error: {}", e))
                })
            })
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                profile = %profile.name,
                status = %output.status,
                "Credential process failed: {}",
                stderr.trim()
            );
            return Err(AssumeError::invalid_profile(
                &profile.name,
                format!(
                    "credential process exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            ));
        }

        parse_output(&profile.name, &output.stdout, Utc::now())
    }
}

/// Parse a Version 1 credential process document
fn parse_output(profile: &str, stdout: &[u8], now: DateTime<Utc>) -> Result<CredentialBundle> {
    let doc: ProcessOutput = serde_json::from_slice(stdout).map_err(|e| {
        AssumeError::invalid_profile(profile, format!("credential process printed invalid JSON: {}", e))
    })?;

    if doc.version != 1 {
        return Err(AssumeError::invalid_profile(
            profile,
            format!("unsupported credential process Version {}", doc.version),
        ));
    }

    let expires_at = doc
        .expiration
        .unwrap_or_else(|| now + Duration::seconds(DEFAULT_LIFETIME_SECS));
    if expires_at <= now {
        return Err(AssumeError::ExpiredAuth(format!(
            "credential process for '{}' returned credentials that expired at {}",
            profile,
            expires_at.to_rfc3339()
        )));
    }

    Ok(CredentialBundle {
        access_key_id: doc.access_key_id,
        secret_access_key: doc.secret_access_key,
        session_token: doc.session_token.filter(|t| !t.is_empty()),
        expires_at,
        source_profile_name: profile.to_string(),
    })
}
