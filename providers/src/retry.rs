//! Fixed-delay HTTP retry policy.
//!
//! The REST provider retries a bounded set of statuses with a fixed
//! delay between attempts: a terminal failure happens after at most
//! `retries + 1` attempts, and the delays sum to `retries * delay` when
//! every attempt was retried.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

use crate::ProviderError;

/// Retry configuration for upstream fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub retries: u32,
    /// Fixed delay before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Statuses worth retrying: rate limiting and transient upstream faults.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Send a request, retrying retryable statuses with a fixed delay.
///
/// `build_request` is called once per attempt. Returns the successful
/// response, or:
/// - [`ProviderError::Transport`] as soon as the transport fails,
/// - [`ProviderError::Status`] immediately for a non-retryable non-2xx
///   status, or after `retries + 1` attempts for a retryable one.
pub async fn send_with_retry<F>(
    build_request: F,
    policy: RetryPolicy,
) -> Result<Response, ProviderError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let response = build_request().send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if is_retryable_status(status) && attempt <= policy.retries {
            tracing::debug!(
                status = status.as_u16(),
                attempt,
                delay_ms = policy.delay.as_millis(),
                "retrying upstream fetch"
            );
            tokio::time::sleep(policy.delay).await;
            continue;
        }

        return Err(ProviderError::Status {
            status: status.as_u16(),
            attempts: attempt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for code in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 404, 418, 501] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }
}
