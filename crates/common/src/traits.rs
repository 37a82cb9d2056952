//! The worker contract.
//!
//! Defined in `conclave-common` so that both the coordinator and agent crates
//! can reference it without circular dependencies.

use crate::{AgentMessage, Result, TaskResult, TaskType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Maximum number of facts an agent keeps.
pub const MAX_LEARNED_FACTS: usize = 64;

/// Per-agent scratch record, mutated only by that agent's own executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_task_id: Option<String>,

    #[serde(default)]
    pub learned_facts: Vec<String>,
}

impl AgentState {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            last_task_id: None,
            learned_facts: Vec::new(),
        }
    }

    /// Record that a task ran and remember any new facts.
    pub fn record<I, S>(&mut self, task_id: &str, facts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.last_task_id = Some(task_id.to_string());
        for fact in facts {
            self.learn(fact.into());
        }
    }

    /// Merge another snapshot of this agent's state into this one.
    ///
    /// Used when several tasks for the same agent run concurrently against
    /// copies of the state.
    pub fn absorb(&mut self, other: AgentState) {
        if other.last_task_id.is_some() {
            self.last_task_id = other.last_task_id;
        }
        for fact in other.learned_facts {
            self.learn(fact);
        }
    }

    fn learn(&mut self, fact: String) {
        if let Some(pos) = self.learned_facts.iter().position(|f| *f == fact) {
            self.learned_facts.remove(pos);
        }
        self.learned_facts.push(fact);
        if self.learned_facts.len() > MAX_LEARNED_FACTS {
            let overflow = self.learned_facts.len() - MAX_LEARNED_FACTS;
            self.learned_facts.drain(..overflow);
        }
    }
}

/// A pluggable worker.
///
/// Implementations must be a pure function of the message plus the state they
/// are handed. Returning `Err` signals an execution fault; "nothing found" is
/// a successful result with zero confidence.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Name used for dispatch, tracing and agent state.
    fn name(&self) -> &str;

    /// Whether this worker accepts the given task type.
    fn handles(&self, task_type: TaskType) -> bool;

    async fn process_task(
        &self,
        message: &AgentMessage,
        state: &mut AgentState,
    ) -> Result<TaskResult>;
}
