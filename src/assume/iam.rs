// IAM role chaining through STS AssumeRole

use std::sync::Arc;

use async_trait::async_trait;

use super::context::AssumeContext;
use super::sigv4::SigningCredentials;
use super::sts::{
    default_session_name, sanitize_session_name, signing_credentials_from_env, AssumeRoleRequest,
    MfaToken, StsApi,
};
use super::Assumer;
use crate::credentials::CredentialBundle;
use crate::error::{AssumeError, Result};
use crate::profile::{BackendType, ProfileDefinition};
use crate::prompt::MfaPrompt;

/// Assumes `role_arn` with the parent hop's credentials, or ambient credentials at the root
pub struct RoleAssumer {
    sts: Arc<dyn StsApi>,
    mfa: Option<Arc<dyn MfaPrompt>>,
}

impl RoleAssumer {
    /// Plain AssumeRole; serves profiles without an MFA device
    pub fn new(sts: Arc<dyn StsApi>) -> Self {
        Self { sts, mfa: None }
    }

    /// AssumeRole with an MFA code; serves profiles with `mfa_serial`
    pub fn with_mfa(sts: Arc<dyn StsApi>, prompt: Arc<dyn MfaPrompt>) -> Self {
        Self {
            sts,
            mfa: Some(prompt),
        }
    }

    fn signing_credentials(
        profile: &ProfileDefinition,
        parent: Option<&CredentialBundle>,
    ) -> Result<SigningCredentials> {
        match parent {
            Some(bundle) => Ok(SigningCredentials::from(bundle)),
            None => signing_credentials_from_env().ok_or_else(|| {
                AssumeError::invalid_profile(
                    &profile.name,
                    "no source_profile and no AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY in the environment",
                )
            }),
        }
    }

    async fn read_mfa(&self, profile: &ProfileDefinition) -> Result<Option<MfaToken>> {
        let (Some(prompt), Some(serial)) = (&self.mfa, &profile.mfa_serial) else {
            return Ok(None);
        };

        let prompt = prompt.clone();
        let name = profile.name.clone();
        let device = serial.clone();
        let code = tokio::task::spawn_blocking(move || prompt.token_code(&name, &device))
            .await
            .map_err(|e| AssumeError::Transient(format!("MFA prompt task failed: {}", e)))?
            .map_err(|e| {
                AssumeError::invalid_profile(&profile.name, format!("could not read MFA code: {}", e))
            })?;

        Ok(Some(MfaToken {
            serial: serial.clone(),
            code,
        }))
    }
}

#[async_trait]
impl Assumer for RoleAssumer {
    fn backend_type(&self) -> BackendType {
        BackendType::IamRoleChain
    }

    fn name(&self) -> &'static str {
        if self.mfa.is_some() {
            "iam-role-mfa"
        } else {
            "iam-role"
        }
    }

    fn priority(&self) -> i32 {
        if self.mfa.is_some() {
            20
        } else {
            10
        }
    }

    fn matches(&self, profile: &ProfileDefinition) -> bool {
        profile.role_arn.is_some() && (self.mfa.is_some() || profile.mfa_serial.is_none())
    }

    async fn assume(
        &self,
        ctx: &AssumeContext,
        profile: &ProfileDefinition,
        parent: Option<&CredentialBundle>,
    ) -> Result<CredentialBundle> {
        let role_arn = profile
            .role_arn
            .clone()
            .ok_or_else(|| AssumeError::invalid_profile(&profile.name, "role_arn is required"))?;
        let creds = Self::signing_credentials(profile, parent)?;

        // Signing credentials must exist before the user is prompted
        let mfa = self.read_mfa(profile).await?;

        let request = AssumeRoleRequest {
            role_arn,
            session_name: profile
                .role_session_name
                .as_deref()
                .map(sanitize_session_name)
                .unwrap_or_else(|| default_session_name(env!("CARGO_PKG_NAME"))),
            duration_seconds: profile.session_duration_seconds,
            mfa,
        };

        tracing::info!(
            profile = %profile.name,
            role_arn = %request.role_arn,
            chained = parent.is_some(),
            mfa = request.mfa.is_some(),
            "Assuming IAM role"
        );

        let creds = self
            .sts
            .assume_role(ctx, &creds, profile.region_or_default(), &request)
            .await?;

        Ok(creds.into_bundle(&profile.name))
    }
}
