//! Message types for coordinator-to-worker dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a subtask asks a worker to perform.
///
/// Dispatch is by this tag; a worker declares which tags it handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Research,
    Comparison,
    Effectiveness,
    Calculation,
    General,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::Research,
        TaskType::Comparison,
        TaskType::Effectiveness,
        TaskType::Calculation,
        TaskType::General,
    ];

    pub fn is_analysis(self) -> bool {
        !matches!(self, TaskType::Research)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Research => "research",
            TaskType::Comparison => "comparison",
            TaskType::Effectiveness => "effectiveness",
            TaskType::Calculation => "calculation",
            TaskType::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "research" => Some(TaskType::Research),
            "comparison" | "compare" => Some(TaskType::Comparison),
            "effectiveness" => Some(TaskType::Effectiveness),
            "calculation" | "calculate" => Some(TaskType::Calculation),
            "general" | "analysis" => Some(TaskType::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work sent from the coordinator to a worker.
///
/// Built once per dispatch and never modified after it is handed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message ID
    pub id: String,

    pub sender: String,

    pub recipient: String,

    pub task_type: TaskType,

    /// `{ "task_id", "query", "instruction", "dependencies": { task_id: data } }`
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Ties every message of one user query together
    pub correlation_id: String,

    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        task_type: TaskType,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            sender: sender.into(),
            recipient: recipient.into(),
            task_type,
            payload: serde_json::Value::Null,
            correlation_id: correlation_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Plan task ID this message dispatches, falling back to the message ID.
    pub fn task_id(&self) -> &str {
        self.payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .unwrap_or(self.id.as_str())
    }

    /// The subtask instruction, falling back to the user query.
    pub fn instruction(&self) -> &str {
        self.payload
            .get("instruction")
            .and_then(|v| v.as_str())
            .or_else(|| self.query())
            .unwrap_or_default()
    }

    pub fn query(&self) -> Option<&str> {
        self.payload.get("query").and_then(|v| v.as_str())
    }

    /// Data of the successful dependency results, keyed by task id.
    pub fn dependencies(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.payload.get("dependencies").and_then(|v| v.as_object())
    }
}
