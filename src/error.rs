// Error handling module
// Defines the normalized failure taxonomy shared by every assumer

use std::fmt;

use thiserror::Error;

use crate::profile::BackendType;

/// Structural problems with the profile configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationKind {
    /// A source_profile reference loops back onto the chain
    CyclicProfileChain,

    /// A profile (requested or referenced) is not defined
    UnknownProfile,

    /// No registered assumer accepts the profile
    NoAssumerForProfile,

    /// The profile is missing a field its backend requires
    InvalidProfile,
}

impl fmt::Display for ConfigurationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigurationKind::CyclicProfileChain => "cyclic profile chain",
            ConfigurationKind::UnknownProfile => "unknown profile",
            ConfigurationKind::NoAssumerForProfile => "no assumer for profile",
            ConfigurationKind::InvalidProfile => "invalid profile",
        };
        f.write_str(name)
    }
}

/// Terminal outcomes of a device authorization that did not produce a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAuthFailure {
    /// The user rejected the request (`access_denied`)
    Denied,

    /// The device code lifetime elapsed (`expired_token` or local deadline)
    Expired,
}

impl fmt::Display for DeviceAuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAuthFailure::Denied => f.write_str("denied by the user"),
            DeviceAuthFailure::Expired => f.write_str("expired before the user approved it"),
        }
    }
}

/// Errors returned by every assumer, mapped from backend specific failures
#[derive(Error, Debug)]
pub enum AssumeError {
    /// Structurally invalid profile graph or profile; never retried
    #[error("configuration error ({kind}) in profile '{profile}': {message}")]
    Configuration {
        kind: ConfigurationKind,
        profile: String,
        message: String,
    },

    /// Authenticated but not authorized for the role; never retried
    #[error("access denied for {role_arn}: {message}")]
    NoAccess { role_arn: String, message: String },

    /// Session or token expired; the hop may be retried once with a fresh login
    #[error("authentication expired: {0}")]
    ExpiredAuth(String),

    /// Network or service error; retried with bounded backoff
    #[error("transient error: {0}")]
    Transient(String),

    /// Interactive login ended without a token; the user must log in again
    #[error("device authorization {0}")]
    DeviceAuthorization(DeviceAuthFailure),

    /// The invocation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl AssumeError {
    /// Build a configuration error
    pub fn configuration(
        kind: ConfigurationKind,
        profile: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AssumeError::Configuration {
            kind,
            profile: profile.into(),
            message: message.into(),
        }
    }

    /// Build an invalid-profile configuration error
    pub fn invalid_profile(profile: impl Into<String>, message: impl Into<String>) -> Self {
        Self::configuration(ConfigurationKind::InvalidProfile, profile, message)
    }

    /// Configuration kind, if this is a configuration error
    pub fn configuration_kind(&self) -> Option<ConfigurationKind> {
        match self {
            AssumeError::Configuration { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Attribute a configuration error to `name`; other variants pass through
    pub fn with_profile(self, name: &str) -> Self {
        match self {
            AssumeError::Configuration { kind, message, .. } => AssumeError::Configuration {
                kind,
                profile: name.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Whether the bounded backoff loop may retry this error
    pub fn is_transient(&self) -> bool {
        matches!(self, AssumeError::Transient(_))
    }
}

/// A failed resolution, identifying the hop that produced the error
#[derive(Error, Debug)]
#[error(
    "profile '{profile}' ({}) failed at hop {hop}: {source}",
    .backend.map(|b| b.as_str()).unwrap_or("unresolved")
)]
pub struct ResolveError {
    /// Profile whose hop failed
    pub profile: String,

    /// Backend of that profile, when it could be determined
    pub backend: Option<BackendType>,

    /// 1-based position in the root-to-leaf chain (0 when the chain could not be built)
    pub hop: usize,

    /// Underlying backend error
    #[source]
    pub source: AssumeError,
}

impl ResolveError {
    /// Failure before any hop ran (chain construction, assumer selection)
    pub fn before_chain(profile: impl Into<String>, source: AssumeError) -> Self {
        Self {
            profile: profile.into(),
            backend: None,
            hop: 0,
            source,
        }
    }
}

/// Result type alias for assumer operations
pub type Result<T> = std::result::Result<T, AssumeError>;
