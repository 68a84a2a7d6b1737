// Profile definition types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Credential source a profile authenticates through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendType {
    /// Federated login through an OIDC device authorization flow
    SsoOidc,

    /// STS AssumeRole, optionally chained from a source profile
    IamRoleChain,

    /// External command printing credentials as JSON
    CredentialProcess,

    /// Identity token from a third party exchanged through STS
    #[serde(rename = "external-idp")]
    ExternalIdentityProvider,
}

impl BackendType {
    /// Stable tag used in cache keys and log output
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::SsoOidc => "sso-oidc",
            BackendType::IamRoleChain => "iam-role-chain",
            BackendType::CredentialProcess => "credential-process",
            BackendType::ExternalIdentityProvider => "external-idp",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSO portal parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsoSettings {
    /// Portal start URL, also the token issuer identity
    pub start_url: String,

    /// Region hosting the OIDC and portal endpoints
    pub region: String,

    pub account_id: String,
    pub role_name: String,

    /// Extra scopes requested when registering the OIDC client
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Where a third-party identity token comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProviderSettings {
    /// File holding the JWT (re-read on every assumption)
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Command printing the JWT on stdout
    #[serde(default)]
    pub token_command: Option<String>,
}

/// A named profile as loaded from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDefinition {
    /// Filled from the profile table key when loaded from a file
    #[serde(default)]
    pub name: String,

    #[serde(rename = "backend")]
    pub backend_type: BackendType,

    #[serde(default)]
    pub role_arn: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub session_duration_seconds: Option<u32>,

    #[serde(default)]
    pub mfa_serial: Option<String>,

    /// Profile whose credentials authenticate this one
    #[serde(default)]
    pub source_profile: Option<String>,

    #[serde(default)]
    pub credential_process: Option<String>,

    #[serde(default)]
    pub sso: Option<SsoSettings>,

    #[serde(default)]
    pub identity_provider: Option<IdentityProviderSettings>,

    #[serde(default)]
    pub role_session_name: Option<String>,
}

impl ProfileDefinition {
    /// Create a bare profile; remaining fields are set with the `with_*` helpers
    pub fn new(name: impl Into<String>, backend_type: BackendType) -> Self {
        Self {
            name: name.into(),
            backend_type,
            role_arn: None,
            region: None,
            session_duration_seconds: None,
            mfa_serial: None,
            source_profile: None,
            credential_process: None,
            sso: None,
            identity_provider: None,
            role_session_name: None,
        }
    }

    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    pub fn with_source(mut self, source_profile: impl Into<String>) -> Self {
        self.source_profile = Some(source_profile.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_mfa_serial(mut self, serial: impl Into<String>) -> Self {
        self.mfa_serial = Some(serial.into());
        self
    }

    pub fn with_credential_process(mut self, command: impl Into<String>) -> Self {
        self.credential_process = Some(command.into());
        self
    }

    pub fn with_sso(mut self, sso: SsoSettings) -> Self {
        self.sso = Some(sso);
        self
    }

    pub fn with_identity_provider(mut self, idp: IdentityProviderSettings) -> Self {
        self.identity_provider = Some(idp);
        self
    }

    /// Region used for service calls, defaulting to us-east-1
    pub fn region_or_default(&self) -> &str {
        self.region.as_deref().unwrap_or("us-east-1")
    }

    /// Check the fields required by the profile's backend
    ///
    /// Returns a human readable description of the first missing field.
    pub fn validate(&self) -> Result<(), String> {
        match self.backend_type {
            BackendType::SsoOidc => {
                if self.sso.is_none() {
                    return Err("sso-oidc profiles need an [sso] table".to_string());
                }
            }
            BackendType::IamRoleChain => {
                if self.role_arn.is_none() {
                    return Err("iam-role-chain profiles need role_arn".to_string());
                }
            }
            BackendType::CredentialProcess => {
                if self.credential_process.is_none() {
                    return Err("credential-process profiles need credential_process".to_string());
                }
            }
            BackendType::ExternalIdentityProvider => {
                if self.role_arn.is_none() {
                    return Err("external-idp profiles need role_arn".to_string());
                }
                match &self.identity_provider {
                    Some(idp) if idp.token_file.is_some() || idp.token_command.is_some() => {}
                    _ => {
                        return Err(
                            "external-idp profiles need identity_provider.token_file or token_command"
                                .to_string(),
                        )
                    }
                }
            }
        }

        if let Some(duration) = self.session_duration_seconds {
            if !(900..=43_200).contains(&duration) {
                return Err(format!(
                    "session_duration_seconds must be between 900 and 43200, got {}",
                    duration
                ));
            }
        }

        Ok(())
    }
}
