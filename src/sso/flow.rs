// Device authorization polling loop

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::client::OidcClient;
use super::types::{
    bounded_lifetime_secs, ClientRegistration, DeviceFlowState, PollOutcome, TokenGrant,
};
use crate::assume::{AssumeContext, BackoffPolicy};
use crate::error::{AssumeError, DeviceAuthFailure, Result};
use crate::profile::SsoSettings;
use crate::prompt::VerificationPrompt;

/// Polling parameters for the device flow
#[derive(Debug, Clone, Copy)]
pub struct FlowPolicy {
    /// Interval used when the provider does not send one
    pub default_interval: Duration,

    /// Added to the interval on every `slow_down`
    pub slow_down_step: Duration,

    /// Applied to consecutive transient poll failures
    pub backoff: BackoffPolicy,
}

impl Default for FlowPolicy {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(5),
            slow_down_step: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Runs one device authorization from request to a terminal state
pub struct DeviceFlow {
    oidc: Arc<dyn OidcClient>,
    prompt: Arc<dyn VerificationPrompt>,
    policy: FlowPolicy,
    state: DeviceFlowState,
}

impl DeviceFlow {
    pub fn new(
        oidc: Arc<dyn OidcClient>,
        prompt: Arc<dyn VerificationPrompt>,
        policy: FlowPolicy,
    ) -> Self {
        Self {
            oidc,
            prompt,
            policy,
            state: DeviceFlowState::Idle,
        }
    }

    pub fn state(&self) -> DeviceFlowState {
        self.state
    }

    fn transition(&mut self, next: DeviceFlowState) {
        tracing::debug!(from = ?self.state, to = ?next, "Device flow state change");
        self.state = next;
    }

    /// Request a device code, show it, and poll until a token or a terminal failure
    pub async fn authorize(
        &mut self,
        ctx: &AssumeContext,
        settings: &SsoSettings,
        registration: &ClientRegistration,
    ) -> Result<TokenGrant> {
        let authorization = self
            .oidc
            .start_device_authorization(ctx, &settings.region, registration, &settings.start_url)
            .await?;
        self.transition(DeviceFlowState::AuthorizationRequested);

        // Polling starts immediately; the prompt is not awaited
        self.prompt
            .display(authorization.url(), &authorization.user_code);

        let deadline =
            Instant::now() + Duration::from_secs(bounded_lifetime_secs(authorization.expires_in));
        let mut interval = authorization
            .interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.policy.default_interval);
        let mut failures: u32 = 0;
        let mut polls: u32 = 0;

        self.transition(DeviceFlowState::PollingForToken);

        loop {
            let wait = if failures > 0 {
                interval.max(self.policy.backoff.delay_for(failures))
            } else {
                interval
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            ctx.sleep(wait.min(remaining)).await?;

            if Instant::now() >= deadline {
                tracing::warn!(polls = polls, "Device code expired before approval");
                self.transition(DeviceFlowState::Expired);
                return Err(AssumeError::DeviceAuthorization(DeviceAuthFailure::Expired));
            }

            polls += 1;
            let outcome = self
                .oidc
                .create_token(ctx, &settings.region, registration, &authorization.device_code)
                .await;

            match outcome {
                Ok(PollOutcome::Pending) => {
                    failures = 0;
                }
                Ok(PollOutcome::SlowDown) => {
                    failures = 0;
                    interval = interval.saturating_add(self.policy.slow_down_step);
                    tracing::debug!(interval_secs = interval.as_secs(), "Provider asked to slow down");
                }
                Ok(PollOutcome::Granted(grant)) => {
                    tracing::info!(polls = polls, "Device authorization approved");
                    self.transition(DeviceFlowState::Authenticated);
                    return Ok(grant);
                }
                Ok(PollOutcome::Denied) => {
                    self.transition(DeviceFlowState::Denied);
                    return Err(AssumeError::DeviceAuthorization(DeviceAuthFailure::Denied));
                }
                Ok(PollOutcome::Expired) => {
                    self.transition(DeviceFlowState::Expired);
                    return Err(AssumeError::DeviceAuthorization(DeviceAuthFailure::Expired));
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.policy.backoff.should_retry(failures) {
                        tracing::error!(failures = failures, "Giving up on device flow polling: {}", e);
                        return Err(e);
                    }
                    tracing::warn!(failures = failures, "Device flow poll failed, backing off: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
