// Temporary credential bundle produced by assumers

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short-lived credentials for one resolved profile
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: DateTime<Utc>,

    /// Profile that produced the bundle
    pub source_profile_name: String,
}

impl CredentialBundle {
    /// True when the bundle stays valid for longer than `margin` after `now`
    pub fn is_valid_beyond(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin > now
    }

    /// True once `expires_at` has passed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Remaining lifetime, zero when already expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .field("expires_at", &self.expires_at)
            .field("source_profile_name", &self.source_profile_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(expires_in: i64) -> CredentialBundle {
        CredentialBundle {
            access_key_id: "ASIATESTKEY".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("session".to_string()),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            source_profile_name: "dev".to_string(),
        }
    }

    #[test]
    fn test_validity_margin() {
        let now = Utc::now();
        assert!(bundle(600).is_valid_beyond(now, Duration::seconds(30)));
        assert!(!bundle(20).is_valid_beyond(now, Duration::seconds(30)));
        assert!(!bundle(-5).is_valid_beyond(now, Duration::seconds(30)));
    }

    #[test]
    fn test_expired_and_remaining() {
        let now = Utc::now();
        let expired = bundle(-10);
        assert!(expired.is_expired_at(now));
        assert_eq!(expired.remaining(now), Duration::zero());
        assert!(bundle(300).remaining(now) > Duration::seconds(200));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let output = format!("{:?}", bundle(60));
        assert!(output.contains("ASIATESTKEY"));
        assert!(!output.contains("secret\""));
        assert!(!output.contains("\"session\""));
        assert!(output.contains("** redacted **"));
    }
}
