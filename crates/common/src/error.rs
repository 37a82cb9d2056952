//! Error types for Conclave.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure the system can report.
///
/// Only [`ErrorKind::ConfigurationError`] is allowed to end a query without a
/// response; every other kind is recovered and recorded in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    AgentExecutionError,
    MemoryStorageError,
    MemoryBackendUnavailable,
    Timeout,
    LlmUnavailable,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::ConfigurationError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::AgentExecutionError => "AgentExecutionError",
            ErrorKind::MemoryStorageError => "MemoryStorageError",
            ErrorKind::MemoryBackendUnavailable => "MemoryBackendUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::LlmUnavailable => "LLMUnavailable",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ConclaveError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Memory storage error: {0}")]
    MemoryStorage(String),

    #[error("Memory backend unavailable: {0}")]
    MemoryBackendUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("LLM unavailable: {message}")]
    LlmUnavailable {
        /// HTTP status returned by the provider, if the request got that far
        status: Option<u16>,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConclaveError {
    pub fn llm(message: impl Into<String>) -> Self {
        Self::LlmUnavailable {
            status: None,
            message: message.into(),
        }
    }

    /// The kind this error is reported as in results and traces.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConclaveError::Configuration(_) => ErrorKind::ConfigurationError,
            ConclaveError::Agent(_) => ErrorKind::AgentExecutionError,
            ConclaveError::MemoryStorage(_) => ErrorKind::MemoryStorageError,
            ConclaveError::MemoryBackendUnavailable(_) => ErrorKind::MemoryBackendUnavailable,
            ConclaveError::Timeout(_) => ErrorKind::Timeout,
            ConclaveError::LlmUnavailable { .. } => ErrorKind::LlmUnavailable,
            // Files are only read while loading configuration or a knowledge source.
            ConclaveError::Io(_) | ConclaveError::Serialization(_) => {
                ErrorKind::ConfigurationError
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
