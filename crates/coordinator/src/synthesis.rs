//! Confidence aggregation and answer composition.

use conclave_common::{ConclaveError, Result, Subtask, TaskResult, TaskType};
use conclave_llm::{LlmClient, LlmRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Attributes shown per research topic.
const MAX_ATTRIBUTES: usize = 3;
/// Values shown per attribute.
const MAX_VALUES: usize = 5;

const SUMMARY_SYSTEM_PROMPT: &str = "Rewrite the findings below into a concise, well-organised \
answer to the user's question. Use only the facts given; do not add new claims. Keep any \
statement about confidence or failed steps.";

/// `Σ(importance·confidence) / Σ(importance)` over successful results.
///
/// Zero when nothing succeeded or every successful subtask has zero weight.
pub fn aggregate_confidence(plan: &[Subtask], results: &[TaskResult]) -> f32 {
    let importance: HashMap<&str, f32> = plan
        .iter()
        .map(|t| (t.id.as_str(), t.importance.max(0.0)))
        .collect();

    let (weighted, total) = results
        .iter()
        .filter(|r| r.success)
        .fold((0.0f32, 0.0f32), |(weighted, total), r| {
            let w = importance.get(r.task_id.as_str()).copied().unwrap_or(0.0);
            (weighted + w * r.confidence, total + w)
        });

    if total <= 0.0 {
        0.0
    } else {
        (weighted / total).clamp(0.0, 1.0)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut shown: Vec<String> = items.iter().take(MAX_VALUES).map(render_value).collect();
            if items.len() > MAX_VALUES {
                shown.push(format!("and {} more", items.len() - MAX_VALUES));
            }
            shown.join(", ")
        }
        Value::Object(map) => map
            .iter()
            .take(MAX_VALUES)
            .map(|(k, v)| format!("{k} ({})", render_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn humanize(name: &str) -> String {
    name.replace('_', " ")
}

fn describe_research(subtask: &Subtask, result: &TaskResult, out: &mut Vec<String>) {
    let topics = result.data.get("research_results").and_then(Value::as_object);
    match topics {
        Some(topics) if !topics.is_empty() && result.confidence > 0.0 => {
            for (topic, facts) in topics {
                let details: Vec<String> = facts
                    .as_object()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .take(MAX_ATTRIBUTES)
                            .map(|(attr, v)| format!("{}: {}", humanize(attr), render_value(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                out.push(format!("- {}: {}", humanize(topic), details.join("; ")));
            }
        }
        _ => out.push(format!(
            "- No stored knowledge matched \"{}\".",
            subtask.instruction
        )),
    }
}

fn describe_analysis(task_type: TaskType, data: &Value, out: &mut Vec<String>) {
    let analysis = &data["analysis"];
    let line = match task_type {
        TaskType::Comparison => {
            let items = render_value(&analysis["items_compared"]);
            let recommendation = analysis["recommendation"].as_str().unwrap_or_default();
            let mut line = format!("Comparison of {items}: {recommendation}.");
            let differences = render_value(&analysis["key_differences"]);
            if !differences.is_empty() {
                line.push_str(&format!(" Key differences: {differences}."));
            }
            line
        }
        TaskType::Effectiveness => format!(
            "Effectiveness: {} (coverage depth {}).",
            render_value(&analysis["findings"]),
            render_value(&analysis["metrics"]["depth"])
        ),
        TaskType::Calculation => format!(
            "Calculation: {} documented values across {} topics.",
            render_value(&analysis["total_values"]),
            render_value(&analysis["topics"])
        ),
        TaskType::General | TaskType::Research => format!(
            "Summary: {}.",
            analysis["summary"].as_str().unwrap_or("no summary available")
        ),
    };
    out.push(line);
}

/// Deterministic answer text from results in plan order.
///
/// Never invents content: when nothing succeeded it says so.
pub fn compose_answer(
    query: &str,
    plan: &[Subtask],
    results: &[TaskResult],
    overall_confidence: f32,
) -> String {
    let by_id: HashMap<&str, &Subtask> = plan.iter().map(|t| (t.id.as_str(), t)).collect();
    let succeeded = results.iter().filter(|r| r.success).count();

    if succeeded == 0 {
        return format!(
            "I was unable to answer \"{query}\": none of the {} planned steps succeeded.",
            results.len()
        );
    }

    let mut findings = Vec::new();
    let mut analysis = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        let Some(subtask) = by_id.get(result.task_id.as_str()) else {
            continue;
        };
        if !result.success {
            let kind = result
                .error_kind()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "error".into());
            failures.push(format!("{} ({kind})", subtask.id));
            continue;
        }
        match subtask.task_type {
            TaskType::Research => describe_research(subtask, result, &mut findings),
            other => describe_analysis(other, &result.data, &mut analysis),
        }
    }

    let mut sections = vec![format!("Findings for \"{query}\":")];
    sections.extend(findings);
    if !analysis.is_empty() {
        sections.push(String::new());
        sections.extend(analysis);
    }
    if !failures.is_empty() {
        sections.push(String::new());
        sections.push(format!("Incomplete steps: {}.", failures.join(", ")));
    }
    sections.push(String::new());
    sections.push(format!("Confidence: {:.0}%", overall_confidence * 100.0));
    sections.join("\n")
}

/// Ask the hosted model to rewrite `draft`, bounded by `timeout`.
pub async fn summarize_with_llm(
    client: &dyn LlmClient,
    query: &str,
    draft: &str,
    timeout: Duration,
) -> Result<String> {
    let request = LlmRequest::prompt(
        SUMMARY_SYSTEM_PROMPT,
        format!("Question: {query}\n\nFindings:\n{draft}"),
    )
    .with_temperature(0.2)
    .with_max_tokens(600);

    let response = tokio::time::timeout(timeout, client.complete(request))
        .await
        .map_err(|_| {
            ConclaveError::llm(format!("summary call exceeded {}ms", timeout.as_millis()))
        })??;

    let text = response.content.trim();
    if text.is_empty() {
        return Err(ConclaveError::llm("summary reply was empty"));
    }
    Ok(text.to_string())
}
