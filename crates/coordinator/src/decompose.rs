//! LLM-assisted query decomposition.
//!
//! The model is asked for a JSON plan. Anything short of a well-formed plan
//! (transport errors, timeouts, prose, unknown task types, duplicate ids,
//! dangling dependencies) is reported as `LlmUnavailable` so the caller can use the
//! rule-based plan instead. Cycles are left for plan validation.

use crate::config::ConfidenceWeights;
use crate::planning::{PlanSource, QueryAnalysis, QueryComplexity};
use conclave_common::{ConclaveError, Result, Subtask, TaskType};
use conclave_llm::{LlmClient, LlmRequest};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Longest instruction accepted from the model.
const MAX_INSTRUCTION_LENGTH: usize = 512;
const MAX_SUBTASKS: usize = 8;

const PLANNER_SYSTEM_PROMPT: &str = r#"You decompose a user question into subtasks for two workers.

Workers:
- research: looks up facts about one topic. Instruction is the topic or question.
- comparison, effectiveness, calculation, general: analyse research output. They MUST depend on at least one research subtask.

Respond with a single JSON object and nothing else:
{
  "complexity": "simple" | "multi_step" | "comparative",
  "subtasks": [
    {"id": "research_1", "task_type": "research", "instruction": "...", "depends_on": []},
    {"id": "comparison_1", "task_type": "comparison", "instruction": "...", "depends_on": ["research_1"]}
  ]
}

Use at most 4 research subtasks. Use short instructions."#;

#[derive(Debug, Deserialize)]
struct PlanReply {
    complexity: Option<String>,
    #[serde(default)]
    subtasks: Vec<SubtaskReply>,
}

#[derive(Debug, Deserialize)]
struct SubtaskReply {
    id: String,
    task_type: String,
    #[serde(default)]
    instruction: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Ask `client` for a plan, bounded by `timeout`.
pub async fn decompose_with_llm(
    client: &dyn LlmClient,
    query: &str,
    weights: &ConfidenceWeights,
    timeout: Duration,
) -> Result<QueryAnalysis> {
    let request = LlmRequest::prompt(PLANNER_SYSTEM_PROMPT, query)
        .with_temperature(0.0)
        .with_max_tokens(800)
        .json();

    let response = tokio::time::timeout(timeout, client.complete(request))
        .await
        .map_err(|_| {
            ConclaveError::llm(format!("planning call exceeded {}ms", timeout.as_millis()))
        })??;

    debug!(model = %response.model, "Planner reply received");
    let analysis = parse_plan(&response.content, query, weights)?;
    info!(
        model = %client.model_name(),
        subtasks = analysis.plan.len(),
        complexity = ?analysis.complexity,
        "LLM plan accepted"
    );
    Ok(analysis)
}

/// Parse and check a planner reply.
pub fn parse_plan(reply: &str, query: &str, weights: &ConfidenceWeights) -> Result<QueryAnalysis> {
    let json = extract_json_object(reply).ok_or_else(|| {
        ConclaveError::llm(format!(
            "no JSON object in planner reply: {}",
            reply.chars().take(200).collect::<String>()
        ))
    })?;
    let parsed: PlanReply = serde_json::from_str(json)
        .map_err(|e| ConclaveError::llm(format!("planner reply is not a plan: {e}")))?;

    if parsed.subtasks.is_empty() {
        return Err(ConclaveError::llm("planner returned an empty plan"));
    }
    if parsed.subtasks.len() > MAX_SUBTASKS {
        return Err(ConclaveError::llm(format!(
            "planner returned {} subtasks, limit is {MAX_SUBTASKS}",
            parsed.subtasks.len()
        )));
    }

    let mut ids: HashSet<&str> = HashSet::with_capacity(parsed.subtasks.len());
    for reply in &parsed.subtasks {
        let id = reply.id.trim();
        if id.is_empty() {
            return Err(ConclaveError::llm("subtask with an empty id"));
        }
        if !ids.insert(id) {
            return Err(ConclaveError::llm(format!("duplicate subtask id '{id}'")));
        }
    }

    let mut plan = Vec::with_capacity(parsed.subtasks.len());
    for reply in &parsed.subtasks {
        let task_type = TaskType::parse(&reply.task_type).ok_or_else(|| {
            ConclaveError::llm(format!(
                "unknown task type '{}' for subtask '{}'",
                reply.task_type, reply.id
            ))
        })?;
        if let Some(dep) = reply.depends_on.iter().find(|d| !ids.contains(d.trim())) {
            return Err(ConclaveError::llm(format!(
                "subtask '{}' depends on unknown subtask '{dep}'",
                reply.id
            )));
        }

        let instruction = match reply.instruction.trim() {
            "" => query.to_string(),
            text => text.chars().take(MAX_INSTRUCTION_LENGTH).collect(),
        };
        plan.push(
            Subtask::new(reply.id.trim(), task_type, instruction)
                .depends_on(reply.depends_on.iter().map(|d| d.trim().to_string()))
                .with_importance(weights.for_task(task_type)),
        );
    }

    if !plan.iter().any(|t| t.task_type == TaskType::Research) {
        return Err(ConclaveError::llm("planner returned no research subtask"));
    }

    let complexity = match parsed.complexity.as_deref().map(str::trim) {
        Some("comparative") => QueryComplexity::Comparative,
        Some("multi_step") | Some("multi-step") => QueryComplexity::MultiStep,
        Some("simple") => QueryComplexity::Simple,
        _ if plan.iter().any(|t| t.task_type == TaskType::Comparison) => {
            QueryComplexity::Comparative
        }
        _ if plan.len() > 1 => QueryComplexity::MultiStep,
        _ => QueryComplexity::Simple,
    };

    Ok(QueryAnalysis {
        complexity,
        plan,
        source: PlanSource::Llm,
    })
}

/// First balanced `{...}` in `s`, skipping braces inside JSON strings.
pub(crate) fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
