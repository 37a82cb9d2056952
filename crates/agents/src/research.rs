//! Research agent - resolves research subtasks against a knowledge source.

use crate::knowledge::{KnowledgeSource, MockKnowledgeBase};
use async_trait::async_trait;
use conclave_common::{AgentMessage, AgentState, Result, TaskExecutor, TaskResult, TaskType};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Score for a topic whose name tokens all appear in the instruction.
const DIRECT_MATCH_SCORE: f32 = 0.9;
/// Score for a topic found only by searching its content.
const CONTENT_MATCH_SCORE: f32 = 0.4;
/// Bonus per additional matching topic.
const EXTRA_MATCH_BONUS: f32 = 0.05;

const IGNORED_WORDS: &[&str] = &[
    "the", "and", "are", "what", "which", "how", "for", "with", "main", "about", "does", "between",
    "compare", "versus", "types", "type", "explain", "tell", "from", "that", "this", "their",
];

/// Research agent over a pluggable [`KnowledgeSource`].
///
/// Confidence is proportional to match quality. Finding nothing is a
/// successful result with zero confidence, not an error.
pub struct ResearchAgent {
    name: String,
    source: Arc<dyn KnowledgeSource>,
}

impl ResearchAgent {
    pub fn new(source: Arc<dyn KnowledgeSource>) -> Self {
        Self {
            name: "research".into(),
            source,
        }
    }

    pub fn with_mock_knowledge() -> Self {
        Self::new(Arc::new(MockKnowledgeBase::default()))
    }
}

fn stem(word: &str) -> &str {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        &word[..word.len() - 1]
    } else {
        word
    }
}

fn instruction_terms(instruction: &str) -> Vec<String> {
    instruction
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| stem(w).to_string())
        .collect()
}

/// Fraction of the topic's name tokens present in `terms`.
fn name_match(topic: &str, terms: &[String]) -> f32 {
    let parts: Vec<&str> = topic.split('_').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return 0.0;
    }
    let matched = parts
        .iter()
        .filter(|p| terms.iter().any(|t| t == stem(p)))
        .count();
    matched as f32 / parts.len() as f32
}

fn content_match(data: &Value, terms: &[String]) -> bool {
    let haystack = data.to_string().to_lowercase();
    terms
        .iter()
        .filter(|t| t.len() >= 3 && !IGNORED_WORDS.contains(&t.as_str()))
        .any(|t| haystack.contains(t.as_str()))
}

#[async_trait]
impl TaskExecutor for ResearchAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Research
    }

    async fn process_task(
        &self,
        message: &AgentMessage,
        state: &mut AgentState,
    ) -> Result<TaskResult> {
        let task_id = message.task_id();
        let instruction = message.instruction();
        info!(
            agent = %self.name,
            task_id = %task_id,
            source = %self.source.name(),
            "Processing research task"
        );

        let topics = self.source.topics().await?;
        let terms = instruction_terms(instruction);

        let mut scored: Vec<(String, Value, f32)> = topics
            .iter()
            .filter_map(|topic| {
                let fraction = name_match(&topic.name, &terms);
                (fraction > 0.0).then(|| {
                    (topic.name.clone(), topic.data.clone(), DIRECT_MATCH_SCORE * fraction)
                })
            })
            .collect();

        if scored.is_empty() {
            scored = topics
                .into_iter()
                .filter(|topic| content_match(&topic.data, &terms))
                .map(|topic| (topic.name, topic.data, CONTENT_MATCH_SCORE))
                .collect();
        }

        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

        let confidence = match scored.first() {
            Some((_, _, best)) => {
                (best + EXTRA_MATCH_BONUS * (scored.len() - 1) as f32).min(1.0)
            }
            None => 0.0,
        };

        let matched_topics: Vec<String> = scored.iter().map(|(name, _, _)| name.clone()).collect();
        let results: Map<String, Value> = scored
            .into_iter()
            .map(|(name, data, _)| (name, data))
            .collect();

        debug!(
            task_id = %task_id,
            matches = matched_topics.len(),
            confidence,
            "Research complete"
        );
        state.record(task_id, matched_topics.iter().map(|t| format!("topic:{t}")));

        Ok(TaskResult::success(
            task_id,
            &self.name,
            json!({
                "query": instruction,
                "matched_topics": matched_topics,
                "research_results": results,
            }),
            confidence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(instruction: &str) -> AgentMessage {
        AgentMessage::new("coordinator", "research", TaskType::Research, "corr")
            .with_payload(json!({ "task_id": "research_1", "instruction": instruction }))
    }

    async fn run(instruction: &str) -> (TaskResult, AgentState) {
        let agent = ResearchAgent::with_mock_knowledge();
        let mut state = AgentState::new("research");
        let result = agent.process_task(&message(instruction), &mut state).await.unwrap();
        (result, state)
    }

    #[tokio::test]
    async fn test_direct_topic_match() {
        let (result, state) = run("What are the main types of neural networks?").await;

        assert!(result.success);
        assert_eq!(result.task_id, "research_1");
        assert!((result.confidence - 0.9).abs() < 1e-6);
        assert_eq!(result.data["matched_topics"], json!(["neural_networks"]));
        assert_eq!(state.last_task_id.as_deref(), Some("research_1"));
        assert_eq!(state.learned_facts, vec!["topic:neural_networks"]);
    }

    #[tokio::test]
    async fn test_partial_name_match_scores_lower() {
        let (result, _) = run("learning").await;

        // "learning" is half of both machine_learning and reinforcement_learning
        assert!((result.confidence - (0.45 + 0.05)).abs() < 1e-6);
        assert_eq!(result.data["research_results"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_content_match_fallback() {
        let (result, _) = run("Tell me about BERT").await;

        assert!(result.success);
        assert!((result.confidence - 0.4).abs() < 1e-6);
        assert_eq!(result.data["matched_topics"], json!(["transformers"]));
    }

    #[tokio::test]
    async fn test_nothing_found_is_zero_confidence_success() {
        let (result, state) = run("medieval poetry").await;

        assert!(result.success);
        assert_eq!(result.confidence, 0.0);
        assert!(result.error.is_none());
        assert!(result.data["research_results"].as_object().unwrap().is_empty());
        assert!(state.learned_facts.is_empty());
    }

    #[test]
    fn test_handles_only_research() {
        let agent = ResearchAgent::with_mock_knowledge();
        assert!(agent.handles(TaskType::Research));
        assert!(!agent.handles(TaskType::Comparison));
    }
}
