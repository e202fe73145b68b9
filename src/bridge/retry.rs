use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::SendError;
use crate::config::LimitsConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            attempts: limits.send_retries.max(1),
            backoff: limits.retry_backoff(),
            timeout: limits.send_timeout(),
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
/// A timed out attempt counts as transient and the backoff doubles between attempts.
pub async fn send_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, SendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SendError>>,
{
    let mut delay = policy.backoff;
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Transient(format!(
                "{operation} timed out after {:?}",
                policy.timeout
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err @ SendError::Permanent(_)) => return Err(err),
            Err(err) if attempt >= policy.attempts => return Err(err),
            Err(err) => {
                warn!(
                    "{} failed attempt={}/{} retry_in_ms={}: {}",
                    operation,
                    attempt,
                    policy.attempts,
                    delay.as_millis(),
                    err
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
