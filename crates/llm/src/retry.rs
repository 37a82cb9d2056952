use async_trait::async_trait;
use conclave_common::{ConclaveError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{LlmClient, LlmRequest, LlmResponse};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 4_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Retries transient provider failures (rate limits, 5xx, dropped connections).
///
/// The caller's own timeout bounds the total time spent here, so a retry
/// loop never outlives the planning deadline.
pub struct RetryingClient<T: LlmClient> {
    inner: T,
    config: RetryConfig,
}

impl<T: LlmClient> RetryingClient<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * jitter_fraction(attempt)) as u64;
        (base as u64)
            .saturating_add(jitter)
            .min(self.config.max_delay_ms)
    }
}

pub(crate) fn is_retryable(error: &ConclaveError) -> bool {
    match error {
        ConclaveError::LlmUnavailable {
            status: Some(status),
            ..
        } => *status == 429 || (500..=599).contains(status),
        // No status means the request never got a response.
        ConclaveError::LlmUnavailable { status: None, message } => {
            message.to_lowercase().contains("request failed")
        }
        _ => false,
    }
}

/// Milliseconds from a `retry-after: N` hint embedded in the error message.
pub(crate) fn parse_retry_after(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    let pos = lower.find("retry-after")?;
    lower[pos..]
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|digits| digits.parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
}

fn jitter_fraction(attempt: u32) -> f64 {
    let x = attempt.wrapping_add(1).wrapping_mul(2_654_435_761);
    (x % 100) as f64 / 100.0
}

#[async_trait]
impl<T: LlmClient> LlmClient for RetryingClient<T> {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let mut attempt = 0;
        loop {
            let error = match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries || !is_retryable(&error) {
                return Err(error);
            }

            let delay = parse_retry_after(&error.to_string())
                .unwrap_or_else(|| self.compute_delay(attempt))
                .min(self.config.max_delay_ms);
            warn!(
                model = %self.inner.model_name(),
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay,
                error = %error,
                "Retrying LLM request"
            );
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyClient {
        calls: Arc<AtomicU32>,
        failures: u32,
        status: Option<u16>,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ConclaveError::LlmUnavailable {
                    status: self.status,
                    message: "provider returned an error".into(),
                });
            }
            Ok(LlmResponse {
                content: "ok".into(),
                model: "flaky".into(),
                usage: None,
                finish_reason: Some("stop".into()),
            })
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn status_decides_retryability() {
        let with_status = |s| ConclaveError::LlmUnavailable {
            status: Some(s),
            message: String::new(),
        };
        assert!(is_retryable(&with_status(429)));
        assert!(is_retryable(&with_status(503)));
        assert!(!is_retryable(&with_status(401)));
        assert!(!is_retryable(&with_status(400)));
        assert!(is_retryable(&ConclaveError::llm("Groq request failed: connection reset")));
        assert!(!is_retryable(&ConclaveError::llm("response had no choices")));
        assert!(!is_retryable(&ConclaveError::Configuration("bad".into())));
    }

    #[test]
    fn retry_after_hint_is_parsed() {
        assert_eq!(parse_retry_after("429 Too Many Requests, retry-after: 3"), Some(3000));
        assert_eq!(parse_retry_after("Retry-After 12s"), Some(12_000));
        assert_eq!(parse_retry_after("rate limited"), None);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let client = RetryingClient::new(
            FlakyClient {
                calls: Arc::new(AtomicU32::new(0)),
                failures: 0,
                status: None,
            },
            RetryConfig {
                max_retries: 5,
                initial_delay_ms: 100,
                max_delay_ms: 350,
                backoff_multiplier: 2.0,
            },
        );
        let first = client.compute_delay(0);
        assert!((100..=110).contains(&first));
        assert!(client.compute_delay(1) >= 200);
        assert_eq!(client.compute_delay(4), 350);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            FlakyClient {
                calls: calls.clone(),
                failures: 2,
                status: Some(503),
            },
            fast_config(3),
        );

        let response = client.complete(LlmRequest::default()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            FlakyClient {
                calls: calls.clone(),
                failures: 10,
                status: Some(429),
            },
            fast_config(2),
        );

        let err = client.complete(LlmRequest::default()).await.unwrap_err();
        assert!(matches!(err, ConclaveError::LlmUnavailable { status: Some(429), .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            FlakyClient {
                calls: calls.clone(),
                failures: 10,
                status: Some(401),
            },
            fast_config(3),
        );

        assert!(client.complete(LlmRequest::default()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
