//! Hosted LLM boundary for Conclave.
//!
//! The model is optional: [`build_llm_client`] returns `None` when no
//! credential is configured, and every call failure surfaces as
//! `ConclaveError::LlmUnavailable` so the coordinator can fall back to
//! rule-based planning.

pub mod client;
pub mod config;
pub mod openai;
pub mod retry;

pub use client::{ChatMessage, LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};
pub use config::{build_llm_client, LlmConfig, SemaphoredClient, API_KEY_ENV};
pub use openai::{OpenAiClient, GROQ_BASE_URL, OPENAI_BASE_URL};
pub use retry::{RetryConfig, RetryingClient};
