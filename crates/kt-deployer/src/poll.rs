//! Bounded "poll until ready" loop shared by every readiness gate.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::DeployError;

/// Attempt budget and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// A policy that polls every `interval` for roughly `budget`.
    #[must_use]
    pub fn within(budget: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            u32::try_from((budget.as_nanos() / interval.as_nanos()).max(1)).unwrap_or(u32::MAX)
        };
        Self::new(attempts, interval)
    }

    /// Returns true if another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The condition holds.
    Ready(T),
    /// Not yet; the reason is kept as the last observed output.
    Retry(String),
    /// Stop polling immediately.
    Abort(DeployError),
}

/// Why polling stopped without success.
#[derive(Debug)]
pub enum PollError {
    /// The attempt budget ran out.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the final attempt.
        last: String,
    },
    /// An attempt aborted.
    Aborted(DeployError),
}

/// Calls `attempt_fn` until it reports ready, aborts, or the budget runs out.
///
/// The delay is only applied between attempts, never after the last one.
pub async fn poll_until<F, Fut, T>(policy: &PollPolicy, what: &str, mut attempt_fn: F) -> Result<T, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt = 0;
    let mut last = String::new();

    while policy.should_retry(attempt) {
        if attempt > 0 {
            sleep(policy.interval).await;
        }
        attempt += 1;

        match attempt_fn(attempt).await {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Abort(e) => return Err(PollError::Aborted(e)),
            Attempt::Retry(reason) => {
                tracing::debug!(what, attempt, max_attempts = policy.max_attempts, reason = %reason, "not ready");
                last = reason;
            }
        }
    }

    Err(PollError::Exhausted { attempts: attempt, last })
}
