use std::future::Future;
use std::time::Duration;

use tracing::warn;

use skein_core::config::RetryConfig;
use skein_core::error::{Result, SkeinError};

pub(crate) fn is_retryable(e: &SkeinError) -> bool {
    match e {
        SkeinError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

pub(crate) fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = config.max_retries;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt < max_retries => {
                let backoff = calculate_backoff(attempt, config);
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying LLM request"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&SkeinError::LlmRequest("HTTP 503: busy".into())));
        assert!(is_retryable(&SkeinError::LlmRequest("connection reset".into())));
        assert!(!is_retryable(&SkeinError::LlmRequest("HTTP 401: bad key".into())));
        assert!(!is_retryable(&SkeinError::Agent("503".into())));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
        };
        let d = calculate_backoff(8, &config);
        assert!(d <= Duration::from_millis(4800));
        assert!(d >= Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&fast(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SkeinError::LlmRequest("HTTP 429: slow down".into()))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SkeinError::LlmRequest("HTTP 500".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SkeinError::LlmRequest("HTTP 400: bad request".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
