//! Configuration for the coordinator.
//!
//! Config files are checked on Unix before they are read: they must be
//! regular files, must not be world-writable, and must not be world-readable
//! when they carry an API key.

use conclave_common::{ConclaveError, Result, TaskType};
use conclave_llm::LlmConfig;
use conclave_memory::MemoryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const STORAGE_PATH_ENV: &str = "CONCLAVE_STORAGE_PATH";
pub const DISTANCE_THRESHOLD_ENV: &str = "CONCLAVE_DISTANCE_THRESHOLD";
pub const CACHE_SIZE_ENV: &str = "CONCLAVE_CACHE_SIZE";
pub const QUERY_TIMEOUT_ENV: &str = "CONCLAVE_QUERY_TIMEOUT_MS";

/// Main coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub llm: LlmConfig,

    pub memory: MemoryConfig,

    /// Deadline for one query, from receipt to synthesis
    pub query_timeout_ms: u64,

    /// Subtasks running at once within one query
    pub max_concurrent_subtasks: usize,

    /// Substitute stored research for fresh work when the reuse policy allows
    pub enable_reuse: bool,

    pub weights: ConfidenceWeights,

    /// JSON file for the research agent's knowledge base
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_path: Option<PathBuf>,
}

/// Importance of each subtask kind in the aggregate confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub research: f32,
    pub analysis: f32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            research: 1.0,
            analysis: 1.5,
        }
    }
}

impl ConfidenceWeights {
    pub fn for_task(&self, task_type: TaskType) -> f32 {
        if task_type.is_analysis() {
            self.analysis
        } else {
            self.research
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            query_timeout_ms: 30_000,
            max_concurrent_subtasks: 4,
            enable_reuse: true,
            weights: ConfidenceWeights::default(),
            knowledge_base_path: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    /// and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let mut config = Self::parse_file(path)?;
        if config.llm.api_key.is_some() {
            warn!(
                path = %path.display(),
                "API key found in config file; prefer CONCLAVE_LLM_API_KEY or the provider's variable"
            );
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without permission checks, overrides or validation.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConclaveError::Configuration(format!("failed to read '{}': {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            ConclaveError::Configuration(format!("invalid config '{}': {e}", path.display()))
        })
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply `CONCLAVE_*` overrides read through `env`.
    pub fn apply_env_with(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = env(STORAGE_PATH_ENV) {
            self.memory.storage_path = PathBuf::from(path);
        }
        if let Some(value) = env(DISTANCE_THRESHOLD_ENV) {
            self.memory.distance_threshold = parse_env(DISTANCE_THRESHOLD_ENV, &value)?;
        }
        if let Some(value) = env(CACHE_SIZE_ENV) {
            self.memory.cache_size = parse_env(CACHE_SIZE_ENV, &value)?;
        }
        if let Some(value) = env(QUERY_TIMEOUT_ENV) {
            self.query_timeout_ms = parse_env(QUERY_TIMEOUT_ENV, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.memory.distance_threshold;
        if !(0.0..=2.0).contains(&threshold) {
            return Err(invalid(format!(
                "memory.distance_threshold must be within [0, 2], got {threshold}"
            )));
        }
        if self.memory.cache_size == 0 {
            return Err(invalid("memory.cache_size must be at least 1"));
        }
        if self.memory.top_k == 0 {
            return Err(invalid("memory.top_k must be at least 1"));
        }
        if self.memory.embedding_dim == 0 {
            return Err(invalid("memory.embedding_dim must be at least 1"));
        }
        if self.query_timeout_ms == 0 {
            return Err(invalid("query_timeout_ms must be positive"));
        }
        if self.llm.timeout_ms == 0 {
            return Err(invalid("llm.timeout_ms must be positive"));
        }
        if self.max_concurrent_subtasks == 0 {
            return Err(invalid("max_concurrent_subtasks must be at least 1"));
        }
        for (name, weight) in [
            ("weights.research", self.weights.research),
            ("weights.analysis", self.weights.analysis),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(format!("{name} must be a non-negative number, got {weight}")));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConclaveError {
    ConclaveError::Configuration(message.into())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{name}={value:?} is not valid: {e}")))
}

#[cfg(unix)]
fn validate_config_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path).map_err(|e| {
        invalid(format!("failed to read config file '{}': {e}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(invalid(format!(
            "config path '{}' is not a regular file",
            path.display()
        )));
    }

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o002 != 0 {
        return Err(invalid(format!(
            "config file '{}' is world-writable (mode {mode:04o}); fix with: chmod o-w {}",
            path.display(),
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        invalid(format!("failed to read config file '{}': {e}", path.display()))
    })?;
    let has_api_key = content
        .lines()
        .any(|line| line.trim_start().starts_with("api_key"));

    if has_api_key && mode & 0o004 != 0 {
        return Err(invalid(format!(
            "config file '{}' contains an API key but is world-readable (mode {mode:04o}); fix with: chmod 600 {}",
            path.display(),
            path.display()
        )));
    }
    if has_api_key && mode & 0o040 != 0 {
        warn!(
            path = %path.display(),
            mode = %format!("{mode:04o}"),
            "Config file with an API key is group-readable; consider chmod 600"
        );
    }
    Ok(())
}
