// Interactive prompts for MFA codes and device verification

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Input};

/// Source of one-time MFA codes
pub trait MfaPrompt: Send + Sync {
    fn token_code(&self, profile: &str, serial: &str) -> Result<String>;
}

/// Shows the device verification URL and user code while the flow polls
pub trait VerificationPrompt: Send + Sync {
    fn display(&self, verification_url: &str, user_code: &str);
}

/// Terminal prompts on stderr, leaving stdout for the credential output
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl MfaPrompt for TerminalPrompt {
    fn token_code(&self, profile: &str, serial: &str) -> Result<String> {
        let code: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("MFA code for {} ({})", profile, serial))
            .validate_with(|input: &String| -> std::result::Result<(), &str> {
                if is_mfa_code(input) {
                    Ok(())
                } else {
                    Err("expected a 6 digit code")
                }
            })
            .interact_text()
            .context("Failed to read MFA code")?;
        Ok(code.trim().to_string())
    }
}

impl VerificationPrompt for TerminalPrompt {
    fn display(&self, verification_url: &str, user_code: &str) {
        eprintln!();
        eprintln!("To sign in, open:");
        eprintln!();
        eprintln!("    {}", verification_url);
        eprintln!();
        eprintln!("and confirm the code: {}", user_code);
        eprintln!();
    }
}

/// Fixed MFA code, for scripted use and tests
#[derive(Debug, Clone)]
pub struct StaticMfaCode(pub String);

impl MfaPrompt for StaticMfaCode {
    fn token_code(&self, _profile: &str, _serial: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Verification prompt that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogVerification;

impl VerificationPrompt for LogVerification {
    fn display(&self, verification_url: &str, user_code: &str) {
        tracing::info!(
            user_code = user_code,
            url = verification_url,
            "Device authorization pending user approval"
        );
    }
}

fn is_mfa_code(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit())
}
