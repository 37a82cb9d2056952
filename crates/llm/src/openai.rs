//! OpenAI-compatible chat completions client. Groq, OpenAI and local
//! servers exposing `/v1/chat/completions` all speak this dialect.

use std::time::Duration;

use async_trait::async_trait;
use conclave_common::{ConclaveError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::client::{LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    model: String,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    /// `timeout` bounds each HTTP round trip, not the retry loop around it.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConclaveError::Configuration(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn role_name(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_body(&self, request: &LlmRequest) -> ChatCompletionRequest {
        let system = request.system_prompt.iter().map(|content| WireMessage {
            role: "system".into(),
            content: content.clone(),
        });
        let turns = request.messages.iter().map(|m| WireMessage {
            role: Self::role_name(m.role).into(),
            content: m.content.clone(),
        });

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: system.chain(turns).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_output
                .then_some(ResponseFormat { kind: "json_object" }),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let mut http_req = self.http_client.post(self.endpoint()).json(&self.build_body(&request));
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| ConclaveError::llm(format!("chat completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(|v| format!(" (retry-after: {v})"))
                .unwrap_or_default();
            let body = response.text().await.unwrap_or_default();
            return Err(ConclaveError::LlmUnavailable {
                status: Some(status.as_u16()),
                message: format!("provider returned {status}{retry_after}: {body}"),
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ConclaveError::llm(format!("unreadable chat completion: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ConclaveError::llm("chat completion had no choices"))?;

        debug!(finish_reason = ?choice.finish_reason, "Chat completion received");
        Ok(LlmResponse {
            content: choice.message.content,
            model: parsed.model,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> OpenAiClient {
        OpenAiClient::new(base, "llama3-8b-8192", Some("gsk-test".into()), Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn plan_request_asks_for_json_object() {
        let request = LlmRequest::prompt("Return a plan.", "Compare CNNs and RNNs")
            .with_temperature(0.0)
            .json();
        let json = serde_json::to_value(client(GROQ_BASE_URL).build_body(&request)).unwrap();

        assert_eq!(json["model"], "llama3-8b-8192");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["response_format"]["type"], "json_object");
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "Compare CNNs and RNNs");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn plain_request_omits_optional_fields() {
        let mut request = LlmRequest::prompt("s", "u");
        request.system_prompt = None;
        let json = serde_json::to_value(client(GROQ_BASE_URL).build_body(&request)).unwrap();

        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert!(json.get("response_format").is_none());
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(
            client(GROQ_BASE_URL).endpoint(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(
            client("http://localhost:11434/").endpoint(),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn unreachable_provider_is_llm_unavailable() {
        // Port 9 (discard) on localhost is not serving HTTP.
        let client = client("http://127.0.0.1:9");
        let err = client.complete(LlmRequest::prompt("s", "u")).await.unwrap_err();
        assert_eq!(err.kind(), conclave_common::ErrorKind::LlmUnavailable);
    }
}
