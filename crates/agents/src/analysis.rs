//! Analysis agent - comparison, effectiveness, calculation and general
//! analysis over research results supplied by dependencies.

use async_trait::async_trait;
use conclave_common::{
    AgentMessage, AgentState, ConclaveError, Result, TaskExecutor, TaskResult, TaskType,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};

const CONFIDENT: f32 = 0.8;
const PARTIAL: f32 = 0.5;
const WEAK: f32 = 0.2;

pub struct AnalysisAgent {
    name: String,
}

impl AnalysisAgent {
    pub fn new() -> Self {
        Self {
            name: "analysis".into(),
        }
    }
}

impl Default for AnalysisAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge `research_results` from every dependency, in dependency-id order.
///
/// Returns `None` when no dependency carries research data at all.
fn collect_research(message: &AgentMessage) -> Option<Map<String, Value>> {
    let deps = message.dependencies()?;
    let mut merged = Map::new();
    let mut found = false;

    for data in deps.values() {
        if let Some(results) = data.get("research_results").and_then(Value::as_object) {
            found = true;
            for (topic, facts) in results {
                merged.entry(topic.clone()).or_insert_with(|| facts.clone());
            }
        }
    }

    found.then_some(merged)
}

fn attribute_names(facts: &Value) -> BTreeSet<String> {
    facts
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default()
}

fn count_values(facts: &Value) -> usize {
    match facts {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.values().map(count_values).sum(),
        Value::Null => 0,
        _ => 1,
    }
}

fn compare(items: &Map<String, Value>) -> (Value, f32) {
    let mut names: Vec<&String> = items.keys().collect();
    names.sort();
    let Some(first) = names.first() else {
        return (json!({ "comparison": "No data to compare" }), WEAK);
    };

    let attribute_sets: Vec<BTreeSet<String>> =
        names.iter().map(|n| attribute_names(&items[n.as_str()])).collect();
    let shared: BTreeSet<String> = attribute_sets
        .iter()
        .skip(1)
        .fold(attribute_names(&items[first.as_str()]), |acc, set| {
            acc.intersection(set).cloned().collect()
        });

    let mut distinguishing = Map::new();
    let mut key_differences = Vec::new();
    let mut broadest: Option<(usize, &String)> = None;
    for (name, attrs) in names.iter().copied().zip(&attribute_sets) {
        let facts = &items[name.as_str()];
        let unique: Vec<&String> = attrs.difference(&shared).collect();
        distinguishing.insert(name.clone(), json!(unique));

        if facts.to_string().to_lowercase().contains("efficiency") {
            key_differences.push(format!("{name}: efficiency considerations"));
        }

        let coverage = count_values(facts);
        if broadest.map_or(true, |(best, _)| coverage > best) {
            broadest = Some((coverage, name));
        }
    }
    let broadest = broadest.map(|(_, name)| name.as_str()).unwrap_or_default();

    let (recommendation, confidence) = if names.len() >= 2 {
        (
            format!("{broadest} has the broadest documented coverage; choose by the distinguishing attributes above"),
            CONFIDENT,
        )
    } else {
        (
            format!("Only {broadest} had research data; comparison is partial"),
            PARTIAL,
        )
    };

    (
        json!({
            "items_compared": names,
            "comparison_summary": format!("Analyzed {} items", names.len()),
            "shared_attributes": shared,
            "distinguishing_attributes": distinguishing,
            "key_differences": key_differences,
            "recommendation": recommendation,
        }),
        confidence,
    )
}

fn effectiveness(items: &Map<String, Value>) -> (Value, f32) {
    let attributes: usize = items.values().map(|f| attribute_names(f).len()).sum();
    let depth = match attributes.checked_div(items.len()).unwrap_or(0) {
        0 => "none",
        1..=2 => "shallow",
        3 => "moderate",
        _ => "deep",
    };

    let findings: Vec<String> = items
        .iter()
        .map(|(name, facts)| format!("{name}: {} documented facts", count_values(facts)))
        .collect();

    let confidence = if items.is_empty() { WEAK } else { CONFIDENT };
    (
        json!({
            "analysis_type": "effectiveness_analysis",
            "findings": findings,
            "metrics": { "coverage": items.len(), "attributes": attributes, "depth": depth },
            "insights": [
                "Each approach has unique strengths",
                "Context-dependent effectiveness"
            ],
        }),
        confidence,
    )
}

fn calculate(items: &Map<String, Value>) -> (Value, f32) {
    let per_topic: Map<String, Value> = items
        .iter()
        .map(|(name, facts)| {
            (
                name.clone(),
                json!({ "attributes": attribute_names(facts).len(), "values": count_values(facts) }),
            )
        })
        .collect();
    let total: usize = items.values().map(count_values).sum();

    let confidence = if items.is_empty() { WEAK } else { CONFIDENT };
    (
        json!({
            "calculation": "Counts over research data",
            "topics": items.len(),
            "total_values": total,
            "per_topic": per_topic,
        }),
        confidence,
    )
}

fn general(items: &Map<String, Value>) -> (Value, f32) {
    let confidence = if items.is_empty() { WEAK } else { CONFIDENT };
    (
        json!({
            "summary": format!("General analysis of {} topics", items.len()),
            "topics": items.keys().collect::<Vec<_>>(),
            "overview": "Data processed and structured for insights",
        }),
        confidence,
    )
}

#[async_trait]
impl TaskExecutor for AnalysisAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type.is_analysis()
    }

    async fn process_task(
        &self,
        message: &AgentMessage,
        state: &mut AgentState,
    ) -> Result<TaskResult> {
        let task_id = message.task_id();
        info!(
            agent = %self.name,
            task_id = %task_id,
            task_type = %message.task_type,
            "Processing analysis task"
        );

        let Some(items) = collect_research(message) else {
            warn!(task_id = %task_id, "No research data in dependencies");
            return Err(ConclaveError::Agent(format!(
                "{} task {task_id} requires research results from its dependencies, none were supplied",
                message.task_type
            )));
        };

        let (analysis, confidence) = match message.task_type {
            TaskType::Comparison => compare(&items),
            TaskType::Effectiveness => effectiveness(&items),
            TaskType::Calculation => calculate(&items),
            TaskType::General => general(&items),
            TaskType::Research => {
                return Err(ConclaveError::Agent(format!(
                    "analysis agent cannot handle research task {task_id}"
                )))
            }
        };

        state.record(
            task_id,
            [format!("{}:{}", message.task_type, items.keys().cloned().collect::<Vec<_>>().join(","))],
        );

        Ok(TaskResult::success(
            task_id,
            &self.name,
            json!({
                "analysis_type": message.task_type,
                "analysis": analysis,
                "input_topics": items.keys().collect::<Vec<_>>(),
            }),
            confidence,
        ))
    }
}
