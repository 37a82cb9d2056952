use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conclave_common::{ConclaveError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::{LlmClient, LlmRequest, LlmResponse};
use crate::openai::{OpenAiClient, GROQ_BASE_URL, OPENAI_BASE_URL};
use crate::retry::{RetryConfig, RetryingClient};

/// Overrides the credential for any provider.
pub const API_KEY_ENV: &str = "CONCLAVE_LLM_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `false` forces rule-based planning even when a credential is present
    pub enabled: bool,
    /// `groq` or `openai`
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Base URL override; also enables keyless local servers
    pub api_url: Option<String>,
    /// Upper bound on one planning or summarization call
    pub timeout_ms: u64,
    /// Rewrite the composed answer through the model
    pub summarize: bool,
    pub max_concurrent_requests: usize,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "groq".into(),
            model: "llama3-8b-8192".into(),
            api_key: None,
            api_url: None,
            timeout_ms: 10_000,
            summarize: false,
            max_concurrent_requests: 2,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn provider_key_env(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "groq" => Some("GROQ_API_KEY"),
            "openai" => Some("OPENAI_API_KEY"),
            _ => None,
        }
    }

    /// Credential lookup: config file, then `CONCLAVE_LLM_API_KEY`, then the
    /// provider's own variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        let non_empty = |v: String| (!v.trim().is_empty()).then_some(v);
        self.api_key
            .clone()
            .and_then(non_empty)
            .or_else(|| env(API_KEY_ENV).and_then(non_empty))
            .or_else(|| {
                self.provider_key_env()
                    .and_then(|name| env(name))
                    .and_then(non_empty)
            })
    }
}

pub struct SemaphoredClient {
    inner: Arc<dyn LlmClient>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl SemaphoredClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl LlmClient for SemaphoredClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ConclaveError::llm(format!("LLM request slot unavailable: {e}")))?;
        self.inner.complete(request).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Build the configured client, or `None` when no credential is available and
/// the system should run in rule-based mode.
///
/// An unknown provider is a configuration error.
pub fn build_llm_client(config: &LlmConfig) -> Result<Option<Arc<dyn LlmClient>>> {
    build_llm_client_with(config, config.resolve_api_key())
}

fn build_llm_client_with(
    config: &LlmConfig,
    api_key: Option<String>,
) -> Result<Option<Arc<dyn LlmClient>>> {
    let default_base = match config.provider.as_str() {
        "groq" => GROQ_BASE_URL,
        "openai" => OPENAI_BASE_URL,
        other => {
            return Err(ConclaveError::Configuration(format!(
                "unknown LLM provider '{other}' (expected groq or openai)"
            )))
        }
    };

    if !config.enabled {
        info!("LLM disabled by configuration, using rule-based planning");
        return Ok(None);
    }
    if api_key.is_none() && config.api_url.is_none() {
        info!(provider = %config.provider, "No LLM credential configured, using rule-based planning");
        return Ok(None);
    }

    let base_url = config.api_url.clone().unwrap_or_else(|| default_base.to_string());
    let client = OpenAiClient::new(base_url, config.model.clone(), api_key, config.timeout())?;
    let retrying = RetryingClient::new(client, config.retry.clone());
    let semaphored = SemaphoredClient::new(Arc::new(retrying), config.max_concurrent_requests);

    info!(provider = %config.provider, model = %config.model, "LLM client ready");
    Ok(Some(Arc::new(semaphored)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: LlmConfig = toml::from_str(
            r#"
model = "llama-3.1-8b-instant"
timeout_ms = 2500

[retry]
max_retries = 0
"#,
        )
        .unwrap();

        assert_eq!(config.provider, "groq");
        assert_eq!(config.model, "llama-3.1-8b-instant");
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert!(!config.summarize);
        assert_eq!(config.max_concurrent_requests, 2);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_delay_ms, RetryConfig::default().initial_delay_ms);
    }

    #[test]
    fn api_key_precedence() {
        let env: HashMap<&str, &str> =
            HashMap::from([(API_KEY_ENV, "from-conclave"), ("GROQ_API_KEY", "from-groq")]);
        let lookup = |name: &str| env.get(name).map(|v| v.to_string());

        let mut config = LlmConfig::default();
        assert_eq!(config.resolve_api_key_with(lookup).as_deref(), Some("from-conclave"));

        config.api_key = Some("from-file".into());
        assert_eq!(config.resolve_api_key_with(lookup).as_deref(), Some("from-file"));

        config.api_key = Some("  ".into());
        let groq_only = |name: &str| (name == "GROQ_API_KEY").then(|| "from-groq".to_string());
        assert_eq!(config.resolve_api_key_with(groq_only).as_deref(), Some("from-groq"));

        config.provider = "openai".into();
        assert_eq!(config.resolve_api_key_with(groq_only), None);
    }

    #[test]
    fn missing_credential_means_fallback_mode() {
        let client = build_llm_client_with(&LlmConfig::default(), None).unwrap();
        assert!(client.is_none());
    }

    #[test]
    fn disabled_config_ignores_credential() {
        let config = LlmConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(build_llm_client_with(&config, Some("gsk-test".into())).unwrap().is_none());
    }

    #[test]
    fn keyed_client_reports_model() {
        let client = build_llm_client_with(&LlmConfig::default(), Some("gsk-test".into()))
            .unwrap()
            .unwrap();
        assert_eq!(client.model_name(), "llama3-8b-8192");
    }

    #[test]
    fn local_server_needs_no_key() {
        let config = LlmConfig {
            provider: "openai".into(),
            model: "llama3".into(),
            api_url: Some("http://localhost:11434".into()),
            ..Default::default()
        };
        assert!(build_llm_client_with(&config, None).unwrap().is_some());
    }

    #[test]
    fn unknown_provider_is_configuration_error() {
        let config = LlmConfig {
            provider: "gemini".into(),
            ..Default::default()
        };
        let err = build_llm_client_with(&config, Some("k".into())).err().unwrap();
        assert!(matches!(err, ConclaveError::Configuration(_)));
    }

    #[tokio::test]
    async fn semaphored_client_limits_concurrency() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingClient {
            concurrent: AtomicU32,
            max_seen: AtomicU32,
        }

        #[async_trait]
        impl LlmClient for CountingClient {
            async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(LlmResponse {
                    content: String::new(),
                    model: "counting".into(),
                    usage: None,
                    finish_reason: None,
                })
            }

            fn model_name(&self) -> &str {
                "counting"
            }
        }

        let inner = Arc::new(CountingClient {
            concurrent: AtomicU32::new(0),
            max_seen: AtomicU32::new(0),
        });
        let client = Arc::new(SemaphoredClient::new(inner.clone(), 2));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.complete(LlmRequest::default()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(inner.max_seen.load(Ordering::SeqCst) <= 2);
    }
}
