//! Per-call deadlines and retry with exponential backoff

use sealup_core::{BackendError, RetryPolicy};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run one backend call under a deadline; expiry counts as a failed call
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(deadline)),
    }
}

/// Retry `call` while it fails with a retryable error and attempts remain
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut call: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = policy.backoff_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    op, attempt, max_attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
