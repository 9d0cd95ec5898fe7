//! Timeouts and bounded exponential backoff for provider calls

use std::future::Future;

use crate::config::ProviderPolicy;
use crate::error::ProviderError;

/// Run `f` under the policy's deadline, retrying transient failures.
///
/// Each attempt is bounded by `policy.timeout()`; an attempt that overruns
/// counts as a transient [`ProviderError`]. Backoff doubles after every
/// failed attempt and is capped at `policy.max_backoff()`. Terminal errors
/// are returned immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &ProviderPolicy,
    provider: &'static str,
    operation: &str,
    mut f: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = policy.initial_backoff();
    let mut attempt: u32 = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout(), f()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(
                provider,
                format!("{} exceeded {}ms", operation, policy.timeout_ms),
            )),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                log::warn!(
                    "{} {} gave up after {} attempts: {}",
                    provider,
                    operation,
                    attempt + 1,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                log::warn!(
                    "{} {} failed (attempt {}/{}), retrying in {}ms: {}",
                    provider,
                    operation,
                    attempt,
                    policy.max_retries + 1,
                    backoff.as_millis(),
                    e
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff());
            }
        }
    }
}
