//! Bounded retry-with-backoff for waits on external state.
//!
//! Used for daemon readiness, mount triggering, and container health
//! polling. Replaces ad-hoc sleep loops with one named utility that always
//! terminates.

use std::future::Future;
use std::time::Duration;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The probed condition became true within the budget.
    Ready,
    /// The attempt budget was exhausted.
    TimedOut,
}

impl WaitOutcome {
    pub fn is_ready(self) -> bool {
        self == WaitOutcome::Ready
    }
}

/// Attempt budget and backoff shape for a bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Delay doubles per attempt up to this cap.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Delay to sleep after attempt `n` (0-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Poll `probe` until it returns true or the budget runs out.
///
/// `what` names the condition in log output only.
pub async fn wait_until<F, Fut>(policy: RetryPolicy, what: &str, mut probe: F) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 0..policy.max_attempts {
        if probe().await {
            tracing::debug!(
                "[Retry] '{}' ready after {} attempt(s)",
                what,
                attempt + 1
            );
            return WaitOutcome::Ready;
        }
        if attempt + 1 < policy.max_attempts {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }
    tracing::warn!(
        "[Retry] '{}' not ready after {} attempts",
        what,
        policy.max_attempts
    );
    WaitOutcome::TimedOut
}
