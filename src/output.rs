// Rendering of resolved credentials for shells and credential_process consumers

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::OutputFormat;
use crate::credentials::CredentialBundle;

/// Version 1 credential_process document
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessDocument<'a> {
    version: u8,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_token: Option<&'a str>,
    expiration: String,
}

pub fn render(bundle: &CredentialBundle, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Env => Ok(render_env(bundle)),
        OutputFormat::Json => {
            let doc = ProcessDocument {
                version: 1,
                access_key_id: &bundle.access_key_id,
                secret_access_key: &bundle.secret_access_key,
                session_token: bundle.session_token.as_deref(),
                expiration: bundle.expires_at.to_rfc3339(),
            };
            let mut json =
                serde_json::to_string_pretty(&doc).context("Failed to serialize credentials")?;
            json.push('\n');
            Ok(json)
        }
    }
}

fn render_env(bundle: &CredentialBundle) -> String {
    let mut lines = vec![
        format!("export AWS_ACCESS_KEY_ID={}", shell_quote(&bundle.access_key_id)),
        format!(
            "export AWS_SECRET_ACCESS_KEY={}",
            shell_quote(&bundle.secret_access_key)
        ),
    ];
    match &bundle.session_token {
        Some(token) => lines.push(format!("export AWS_SESSION_TOKEN={}", shell_quote(token))),
        None => lines.push("unset AWS_SESSION_TOKEN".to_string()),
    }
    lines.push(format!(
        "export AWS_CREDENTIAL_EXPIRATION={}",
        bundle.expires_at.to_rfc3339()
    ));
    lines.push(format!(
        "export ROLEGATE_PROFILE={}",
        shell_quote(&bundle.source_profile_name)
    ));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Single-quote a value for POSIX shells
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}
