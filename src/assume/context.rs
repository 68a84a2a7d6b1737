// Per-invocation context handed to assumers

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AssumeError, Result};

/// Cancellation and login policy for one assumption
#[derive(Debug, Clone)]
pub struct AssumeContext {
    cancel: CancellationToken,
    force_login: bool,
}

impl AssumeContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            force_login: false,
        }
    }

    /// Context with its own token, never cancelled unless `cancel` is called
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether cached login material must be ignored in favour of a fresh login
    pub fn force_login(&self) -> bool {
        self.force_login
    }

    /// Copy of this context that demands a fresh interactive login
    pub fn with_force_login(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            force_login: true,
        }
    }

    /// Run `fut`, abandoning it as soon as the context is cancelled
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AssumeError::Cancelled),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, waking early with `Cancelled`
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AssumeError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
