//! Subtask and result types for query plans.

use crate::error::ErrorKind;
use crate::message::TaskType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work in a query plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Plan-local task ID (e.g. `research_1`)
    pub id: String,

    pub task_type: TaskType,

    /// What the worker should do, in plain text
    pub instruction: String,

    /// IDs of subtasks whose results this one consumes
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Weight of this subtask in the aggregate confidence
    #[serde(default = "default_importance")]
    pub importance: f32,
}

fn default_importance() -> f32 {
    1.0
}

impl Subtask {
    pub fn new(id: impl Into<String>, task_type: TaskType, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type,
            instruction: instruction.into(),
            depends_on: Vec::new(),
            importance: default_importance(),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.max(0.0);
        self
    }
}

/// Error carried by a failed [`TaskResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of exactly one dispatched (or reused) subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,

    pub agent_name: String,

    pub success: bool,

    #[serde(default)]
    pub data: serde_json::Value,

    /// Always within `[0, 1]`
    pub confidence: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    pub produced_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(
        task_id: impl Into<String>,
        agent_name: impl Into<String>,
        data: serde_json::Value,
        confidence: f32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            success: true,
            data,
            confidence: clamp_confidence(confidence),
            error: None,
            produced_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        agent_name: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            success: false,
            data: serde_json::Value::Null,
            confidence: 0.0,
            error: Some(TaskError {
                kind,
                message: message.into(),
            }),
            produced_at: Utc::now(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
