use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::IssueError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    #[builder(default = 5)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_secs(1))]
    pub initial_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails terminally, or the attempt budget is spent.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, IssueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IssueError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                debug!(attempt, "{what} failed: {err}, retrying in {delay:?}");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(attempt, "{what} failed, giving up: {err}");
                }
                return Err(err);
            }
        }
    }
}
