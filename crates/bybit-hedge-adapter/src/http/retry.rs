/*
[INPUT]:  A request attempt closure and a retry policy
[OUTPUT]: The first accepted envelope, or the last error once retries are exhausted
[POS]:    HTTP layer - retry/backoff driver wrapped around every REST call
[UPDATE]: When changing backoff timing or which failures are retried
*/

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::http::error::Result;
use crate::http::response::ApiResponse;

/// Retry budget for a single logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts with backoff after a retryable failure
    pub max_retries: u32,
    /// Immediate re-sends for transient return codes, counted separately
    pub max_transient_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            max_transient_retries: 3,
        }
    }
}

/// Delay before the next attempt while `remaining` retries are still left.
///
/// With three retries the sequence is 10s, 5s, 2s.
pub fn backoff_delay(remaining: u32) -> Duration {
    let remaining = u64::from(remaining);
    Duration::from_secs(remaining * remaining + 1)
}

/// Drive `attempt` until it succeeds or the policy is exhausted.
///
/// Transient envelopes are re-sent at once; once their budget runs out the
/// envelope is handed back as-is since those codes are on the allow-list.
pub async fn with_retry<F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut attempt: F,
) -> Result<ApiResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ApiResponse>>,
{
    let mut remaining = policy.max_retries;
    let mut transient_left = policy.max_transient_retries;

    loop {
        match attempt().await {
            Ok(response) if response.is_transient() && transient_left > 0 => {
                transient_left -= 1;
                debug!(
                    label,
                    ret_code = response.ret_code,
                    transient_left,
                    "transient return code, re-sending"
                );
            }
            Ok(response) => return Ok(response),
            Err(err) if err.is_transient_code() && transient_left > 0 => {
                transient_left -= 1;
                debug!(label, error = %err, transient_left, "transient API error, re-sending");
            }
            Err(err) if err.is_retryable() && remaining > 0 => {
                let delay = backoff_delay(remaining);
                warn!(
                    label,
                    error = %err,
                    remaining,
                    delay_secs = delay.as_secs(),
                    "request failed, retrying after backoff"
                );
                remaining -= 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::BybitError;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn envelope(ret_code: i64) -> ApiResponse {
        ApiResponse {
            ret_code,
            ret_msg: "OK".to_string(),
            result: Value::Null,
            time: None,
        }
    }

    fn rate_limited() -> BybitError {
        BybitError::Api {
            code: 10006,
            message: "Too many visits".to_string(),
        }
    }

    #[test]
    fn backoff_follows_square_plus_one() {
        assert_eq!(backoff_delay(3), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn api_errors_back_off_then_surface_on_fourth_failure() {
        let calls = Mutex::new(Vec::new());
        let policy = RetryPolicy {
            max_retries: 3,
            max_transient_retries: 0,
        };

        let result = with_retry(policy, "test", || {
            calls.lock().unwrap().push(Instant::now());
            async { Err(rate_limited()) }
        })
        .await;

        assert_eq!(result.unwrap_err().api_code(), Some(10006));

        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<u64> = calls
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![10, 5, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_response_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(RetryPolicy::default(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BybitError::InvalidResponse("missing retCode".into())) }
        })
        .await;

        assert!(matches!(result, Err(BybitError::InvalidResponse(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_codes_resend_immediately_and_are_bounded() {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let policy = RetryPolicy {
            max_retries: 0,
            max_transient_retries: 2,
        };

        let response = with_retry(policy, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(envelope(10001)) }
        })
        .await
        .unwrap();

        assert_eq!(response.ret_code, 10001);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_one_failure() {
        let attempts = AtomicU32::new(0);
        let response = with_retry(RetryPolicy::default(), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(rate_limited())
                } else {
                    Ok(envelope(0))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(response.ret_code, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
