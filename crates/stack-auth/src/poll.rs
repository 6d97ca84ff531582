//! Client-side polling for CLI login completion
//!
//! The CLI holds a polling code and asks the server, over and over, whether
//! the matching login code was confirmed. [`exchange_for_token`] drives that
//! loop: exponential backoff between polls, a hard deadline, transient
//! failures retried, and a cancellation token checked on every iteration.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Outcome of one poll.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    /// Not confirmed yet
    Waiting,
    /// Confirmed; the request record is gone and the token is handed over
    Success { refresh_token: String },
    /// Expired or cancelled; the user has to start again
    Expired,
}

impl PollStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PollStatus::Waiting => "waiting",
            PollStatus::Success { .. } => "success",
            PollStatus::Expired => "expired",
        }
    }
}

impl fmt::Debug for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollStatus::Waiting => f.write_str("Waiting"),
            PollStatus::Success { .. } => f
                .debug_struct("Success")
                .field("refresh_token", &"[REDACTED]")
                .finish(),
            PollStatus::Expired => f.write_str("Expired"),
        }
    }
}

/// Something that can answer "is this login confirmed yet?".
///
/// Implemented in-process by [`CliLoginFlow`](crate::CliLoginFlow) and over
/// HTTP by the CLI.
#[async_trait]
pub trait LoginPoller: Send + Sync {
    async fn poll(&self, polling_code: &str) -> Result<PollStatus>;
}

/// Backoff schedule and deadline for the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: u32,
    /// Overall deadline, measured from the first poll
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            multiplier: 2,
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl PollPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay after the `attempt`-th poll (zero-based), capped at `max_interval`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }
}

/// Poll until the login is confirmed, then return the refresh token.
///
/// Terminal outcomes:
/// - `Ok(refresh_token)` once the server reports success
/// - `LoginCodeExpired` if the server reports the request expired
/// - `Cancelled` as soon as `cancel` fires, even mid-request
/// - `PollTimeout` once `policy.timeout` has elapsed
/// - any non-retryable error from the poller
pub async fn exchange_for_token<P>(
    poller: &P,
    polling_code: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<String>
where
    P: LoginPoller + ?Sized,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = poller.poll(polling_code) => outcome,
        };

        match outcome {
            Ok(PollStatus::Success { refresh_token }) => {
                info!(attempts = attempt + 1, "login confirmed");
                return Ok(refresh_token);
            }
            Ok(PollStatus::Expired) => return Err(Error::LoginCodeExpired),
            Ok(PollStatus::Waiting) => debug!(attempt, "login not confirmed yet"),
            Err(e) if e.is_retryable() => {
                warn!(attempt, error = %e, "login poll failed, will retry");
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::PollTimeout(policy.timeout));
        }
        let wake = (now + policy.delay_for(attempt)).min(deadline);
        attempt = attempt.saturating_add(1);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
