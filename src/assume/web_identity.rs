// Third-party identity token exchanged through AssumeRoleWithWebIdentity

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::context::AssumeContext;
use super::sts::{default_session_name, sanitize_session_name, StsApi, WebIdentityRequest};
use super::Assumer;
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, Result};
use crate::profile::{BackendType, IdentityProviderSettings, ProfileDefinition};

pub struct WebIdentityAssumer {
    sts: Arc<dyn StsApi>,
}

impl WebIdentityAssumer {
    pub fn new(sts: Arc<dyn StsApi>) -> Self {
        Self { sts }
    }
}

/// Read the identity token, preferring the file over the command
async fn read_token(
    ctx: &AssumeContext,
    profile: &str,
    settings: &IdentityProviderSettings,
) -> Result<String> {
    let token = if let Some(path) = &settings.token_file {
        read_token_file(profile, path).await?
    } else if let Some(command) = &settings.token_command {
        run_token_command(ctx, profile, command).await?
    } else {
        return Err(AssumeError::invalid_profile(
            profile,
            "identity_provider needs token_file or token_command",
        ));
    };

    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(AssumeError::invalid_profile(profile, "identity token is empty"));
    }
    Ok(token)
}

async fn read_token_file(profile: &str, path: &Path) -> Result<String> {
    let path = crate::config::expand_tilde(&path.to_string_lossy());
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        AssumeError::invalid_profile(
            profile,
            format!("cannot read identity token file {}: {}", path.display(), e),
        )
    })
}

async fn run_token_command(ctx: &AssumeContext, profile: &str, command: &str) -> Result<String> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            AssumeError::invalid_profile(profile, format!("failed to start token command: {}", e))
        })?;

    let output = ctx
        .run(async {
            child
                .wait_with_output()
                .await
                .map_err(|e| AssumeError::Transient(format!("token command I/O error: {}", e)))
        })
        .await?;

    if !output.status.success() {
        return Err(AssumeError::invalid_profile(
            profile,
            format!(
                "token command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    String::from_utf8(output.stdout).map_err(|_| {
        AssumeError::invalid_profile(profile, "token command printed non UTF-8 output")
    })
}

#[async_trait]
impl Assumer for WebIdentityAssumer {
    fn backend_type(&self) -> BackendType {
        BackendType::ExternalIdentityProvider
    }

    fn name(&self) -> &'static str {
        "web-identity"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn matches(&self, profile: &ProfileDefinition) -> bool {
        profile.role_arn.is_some() && profile.identity_provider.is_some()
    }

    async fn assume(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        _parent: Option<&CredentialBundle>,
    ) -> Result<CredentialBundle> {
        let (Some(role_arn), Some(settings)) = (&profile.role_arn, &profile.identity_provider)
        else {
            return Err(AssumeError::invalid_profile(
                &profile.name,
                "external-idp profiles need role_arn and identity_provider",
            ));
        };

        // The token is re-read on every assumption; providers rotate it
        let token = read_token(ctx, &profile.name, settings).await?;

        let request = WebIdentityRequest {
            role_arn: role_arn.clone(),
            session_name: profile
                .role_session_name
                .as_deref()
                .map(sanitize_session_name)
                .unwrap_or_else(|| default_session_name(env!("CARGO_PKG_NAME"))),
            duration_seconds: profile.session_duration_seconds,
            token,
        };

        tracing::info!(
            profile = %profile.name,
            role_arn = %request.role_arn,
            "Exchanging identity token"
        );

        let creds = self
            .sts
            .assume_role_with_web_identity(ctx, profile.region_or_default(), &request)
            .await?;
        Ok(creds.into_bundle(&profile.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assume::sigv4::SigningCredentials;
    use crate::assume::sts::{AssumeRoleRequest, StsCredentials};
    use chrono::{Duration, Utc};
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TokenCapture {
        tokens: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StsApi for TokenCapture {
        async fn assume_role(
            &self,
            _ctx: &AssumeContext,
            _creds: &SigningCredentials,
            _region: &str,
            _request: &AssumeRoleRequest,
        ) -> Result<StsCredentials> {
            Err(AssumeError::Transient("unused".to_string()))
        }

        async fn assume_role_with_web_identity(
            &self,
            _ctx: &AssumeContext,
            _region: &str,
            request: &WebIdentityRequest,
        ) -> Result<StsCredentials> {
            self.tokens.lock().unwrap().push(request.token.clone());
            Ok(StsCredentials {
                access_key_id: "ASIAWEB".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: "session".to_string(),
                expiration: Utc::now() + Duration::hours(1),
            })
        }
    }

    fn profile(settings: IdentityProviderSettings) -> ProfileDefinition {
        ProfileDefinition::new("ci", BackendType::ExternalIdentityProvider)
            .with_role_arn("arn:aws:iam::111122223333:role/ci")
            .with_identity_provider(settings)
    }

    #[tokio::test]
    async fn test_token_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "eyJhbGciOiJSUzI1NiJ9.payload.sig").unwrap();

        let sts = Arc::new(TokenCapture::default());
        let assumer = WebIdentityAssumer::new(sts.clone());
        let bundle = assumer
            .assume(
                &AssumeContext::detached(),
                &profile(IdentityProviderSettings {
                    token_file: Some(file.path().to_path_buf()),
                    token_command: None,
                }),
                None,
            )
            .await
            .unwrap();

        assert_eq!(bundle.access_key_id, "ASIAWEB");
        assert_eq!(
            sts.tokens.lock().unwrap().as_slice(),
            ["eyJhbGciOiJSUzI1NiJ9.payload.sig".to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_token_read_from_command() {
        let sts = Arc::new(TokenCapture::default());
        let assumer = WebIdentityAssumer::new(sts.clone());
        assumer
            .assume(
                &AssumeContext::detached(),
                &profile(IdentityProviderSettings {
                    token_file: None,
                    token_command: Some("echo command-token".to_string()),
                }),
                None,
            )
            .await
            .unwrap();

        assert_eq!(sts.tokens.lock().unwrap()[0], "command-token");
    }

    #[tokio::test]
    async fn test_missing_token_file_is_configuration_error() {
        let assumer = WebIdentityAssumer::new(Arc::new(TokenCapture::default()));
        let err = assumer
            .assume(
                &AssumeContext::detached(),
                &profile(IdentityProviderSettings {
                    token_file: Some("/nonexistent/rolegate/token".into()),
                    token_command: None,
                }),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.configuration_kind().is_some());
    }
}
