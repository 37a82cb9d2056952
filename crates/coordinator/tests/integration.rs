//! Integration tests for the coordinator pipeline.
//!
//! These run without a hosted model: planning is rule-based unless a test
//! injects a scripted `LlmClient`. Faults are injected through test doubles
//! implementing the worker and store traits.

use async_trait::async_trait;
use conclave_agents::{AnalysisAgent, ResearchAgent};
use conclave_common::{
    AgentMessage, AgentState, ConclaveError, ErrorKind, Result, TaskExecutor, TaskResult,
    TaskType,
};
use conclave_coordinator::{
    Coordinator, CoordinatorConfig, Phase, PlanSource, TraceEvent, MEMORY_AGENT,
};
use conclave_llm::{LlmClient, LlmRequest, LlmResponse};
use conclave_memory::{
    FileVectorStore, HashingEmbedder, KnowledgeEntry, MemoryConfig, MemoryError,
    MemorySubsystem, MetadataStore, ReuseVerdict, StoredRecord,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SIMPLE_QUERY: &str = "What are the main types of neural networks?";
const MULTI_STEP_QUERY: &str = "Explain the tradeoffs of transformers";

fn ephemeral_memory() -> Arc<MemorySubsystem> {
    Arc::new(MemorySubsystem::ephemeral(MemoryConfig::default()).unwrap())
}

fn create_test_coordinator() -> Coordinator {
    Coordinator::new(CoordinatorConfig::default(), ephemeral_memory()).with_default_agents()
}

// ============================================================================
// Test doubles
// ============================================================================

/// Wraps a worker, optionally delaying it, and logs start/finish order.
struct Recording {
    inner: Arc<dyn TaskExecutor>,
    delay_for: Option<(&'static str, Duration)>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recording {
    fn new(inner: Arc<dyn TaskExecutor>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            inner,
            delay_for: None,
            log,
        }
    }

    /// Delay tasks whose instruction contains `needle`.
    fn delaying(mut self, needle: &'static str, delay: Duration) -> Self {
        self.delay_for = Some((needle, delay));
        self
    }
}

#[async_trait]
impl TaskExecutor for Recording {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handles(&self, task_type: TaskType) -> bool {
        self.inner.handles(task_type)
    }

    async fn process_task(
        &self,
        message: &AgentMessage,
        state: &mut AgentState,
    ) -> Result<TaskResult> {
        let task_id = message.task_id().to_string();
        self.log.lock().unwrap().push(format!("start:{task_id}"));
        if let Some((needle, delay)) = self.delay_for {
            if message.instruction().contains(needle) {
                tokio::time::sleep(delay).await;
            }
        }
        let result = self.inner.process_task(message, state).await;
        self.log.lock().unwrap().push(format!("end:{task_id}"));
        result
    }
}

/// Analysis worker that always raises an execution fault.
struct FailingAnalysis;

#[async_trait]
impl TaskExecutor for FailingAnalysis {
    fn name(&self) -> &str {
        "analysis"
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type.is_analysis()
    }

    async fn process_task(&self, _: &AgentMessage, _: &mut AgentState) -> Result<TaskResult> {
        Err(ConclaveError::Agent("forced analysis fault".into()))
    }
}

/// Research worker that never finishes in time.
struct HangingResearch;

#[async_trait]
impl TaskExecutor for HangingResearch {
    fn name(&self) -> &str {
        "research"
    }

    fn handles(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Research
    }

    async fn process_task(&self, _: &AgentMessage, _: &mut AgentState) -> Result<TaskResult> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ConclaveError::Agent("should have been aborted".into()))
    }
}

/// LLM client with a canned reply, or an error when `reply` is `None`.
struct ScriptedLlm {
    reply: Option<String>,
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
        match &self.reply {
            Some(content) => Ok(LlmResponse {
                content: content.clone(),
                model: "scripted".into(),
                usage: None,
                finish_reason: Some("stop".into()),
            }),
            None => Err(ConclaveError::LlmUnavailable {
                status: Some(503),
                message: "service unavailable".into(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Metadata store whose writes always fail.
struct FailingMetadata;

#[async_trait]
impl MetadataStore for FailingMetadata {
    async fn insert(&self, _record: StoredRecord) -> std::result::Result<(), MemoryError> {
        Err(MemoryError::Storage("disk full".into()))
    }

    async fn remove(&self, _id: &str) -> std::result::Result<Option<StoredRecord>, MemoryError> {
        Ok(None)
    }

    async fn get(&self, _id: &str) -> std::result::Result<Option<StoredRecord>, MemoryError> {
        Ok(None)
    }

    async fn all(&self) -> std::result::Result<Vec<StoredRecord>, MemoryError> {
        Ok(Vec::new())
    }
}

fn plan_source(events: &[TraceEvent]) -> Option<PlanSource> {
    events.iter().find_map(|e| match e {
        TraceEvent::PlanCreated { source, .. } => Some(*source),
        _ => None,
    })
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_simple_query_runs_one_research_subtask() {
    let coordinator = create_test_coordinator();
    let response = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();

    assert_eq!(
        response.trace.phases(),
        vec![
            Phase::Received,
            Phase::Analyzed,
            Phase::MemoryChecked,
            Phase::Planned,
            Phase::Dispatching,
            Phase::Synthesized,
            Phase::Stored,
            Phase::Done,
        ]
    );
    assert!(response.trace.was_computed("research_1"));
    assert!(!response.trace.was_reused("research_1"));
    assert!(!response.trace.degraded);
    assert!(response.overall_confidence > 0.0);
    assert!(response.final_answer.contains("neural networks"));

    let record_id = response.record_id.expect("conversation stored");
    let record = coordinator
        .memory()
        .get_conversation(&record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.subtask_plan.len(), 1);
    assert_eq!(record.results.len(), 1);
    assert!((record.results[0].confidence - response.overall_confidence).abs() < 1e-6);
}

#[tokio::test]
async fn test_repeated_query_reuses_memory() {
    let coordinator = create_test_coordinator();
    let first = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    assert!(!first.trace.was_reused("research_1"));

    let second = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    assert!(second.trace.was_reused("research_1"));
    assert!(!second.trace.was_computed("research_1"));

    let distance = second.trace.reuse_distance("research_1").unwrap();
    assert!(distance <= MemoryConfig::default().distance_threshold);
    assert!(second.overall_confidence > 0.0);
    assert!(second.overall_confidence <= first.overall_confidence + 1e-6);

    let record = coordinator
        .memory()
        .get_conversation(second.record_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.results[0].agent_name, MEMORY_AGENT);

    // Reused results are not stored again.
    let stats = coordinator.memory().stats().await.unwrap();
    assert_eq!(stats.knowledge_entries, 1);
    assert_eq!(stats.conversations, 2);
}

#[tokio::test]
async fn test_decoy_with_disjoint_topics_is_not_reused() {
    let coordinator = create_test_coordinator();
    coordinator
        .memory()
        .store(
            KnowledgeEntry::new(SIMPLE_QUERY, "seed")
                .with_topics(["cooking"])
                .with_payload(json!({ "research_results": { "soup": { "kinds": ["miso"] } } }), 1.0),
        )
        .await
        .unwrap();

    let response = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    assert!(!response.trace.was_reused("research_1"));
    assert!(response.trace.was_computed("research_1"));

    let verdicts: Vec<&ReuseVerdict> = response
        .trace
        .events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::MemoryLookup { candidates, .. } => Some(candidates),
            _ => None,
        })
        .flatten()
        .map(|c| &c.verdict)
        .collect();
    assert!(verdicts.contains(&&ReuseVerdict::TopicMismatch));
    assert!(!response.final_answer.contains("miso"));
}

#[tokio::test]
async fn test_reuse_can_be_disabled() {
    let config = CoordinatorConfig {
        enable_reuse: false,
        ..Default::default()
    };
    let coordinator = Coordinator::new(config, ephemeral_memory()).with_default_agents();

    coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    let second = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    assert!(second.trace.was_computed("research_1"));
    assert!(!second.trace.was_reused("research_1"));
}

#[tokio::test]
async fn test_multi_step_analysis_waits_for_research() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let coordinator = Coordinator::new(CoordinatorConfig::default(), ephemeral_memory())
        .with_worker(Arc::new(
            Recording::new(Arc::new(ResearchAgent::with_mock_knowledge()), log.clone())
                .delaying("transformers", Duration::from_millis(50)),
        ))
        .with_worker(Arc::new(Recording::new(
            Arc::new(AnalysisAgent::new()),
            log.clone(),
        )));

    let response = coordinator.process_user_query(MULTI_STEP_QUERY).await.unwrap();

    assert!(response
        .trace
        .plan_edges()
        .contains(&("research_1".to_string(), "general_1".to_string())));
    assert!(response.trace.was_computed("research_1"));
    assert!(response.trace.was_computed("general_1"));

    let log = log.lock().unwrap().clone();
    let research_end = log.iter().position(|e| e == "end:research_1").unwrap();
    let analysis_start = log.iter().position(|e| e == "start:general_1").unwrap();
    assert!(research_end < analysis_start, "{log:?}");
}

#[tokio::test]
async fn test_results_keep_plan_order_when_completion_order_differs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let coordinator = Coordinator::new(CoordinatorConfig::default(), ephemeral_memory())
        .with_worker(Arc::new(
            Recording::new(Arc::new(ResearchAgent::with_mock_knowledge()), log.clone())
                .delaying("transformers", Duration::from_millis(100)),
        ))
        .with_worker(Arc::new(AnalysisAgent::new()));

    let response = coordinator
        .process_user_query("Compare transformers vs reinforcement learning")
        .await
        .unwrap();

    // The delayed subject finishes last...
    let log = log.lock().unwrap().clone();
    let first_end = log.iter().position(|e| e == "end:research_1").unwrap();
    let second_end = log.iter().position(|e| e == "end:research_2").unwrap();
    assert!(second_end < first_end, "{log:?}");

    // ...but the stored results follow the plan.
    let record = coordinator
        .memory()
        .get_conversation(response.record_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let ids: Vec<&str> = record.results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["research_1", "research_2", "comparison_1"]);
    let planned: Vec<&str> = record.subtask_plan.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, planned);
}

#[tokio::test]
async fn test_partial_failure_still_answers() {
    let coordinator = Coordinator::new(CoordinatorConfig::default(), ephemeral_memory())
        .with_worker(Arc::new(ResearchAgent::with_mock_knowledge()))
        .with_worker(Arc::new(FailingAnalysis));

    let response = coordinator.process_user_query(MULTI_STEP_QUERY).await.unwrap();

    assert!(response
        .trace
        .error_kinds()
        .contains(&ErrorKind::AgentExecutionError));
    assert!(response.final_answer.contains("Incomplete steps"));

    let record = coordinator
        .memory()
        .get_conversation(response.record_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let research = &record.results[0];
    let analysis = &record.results[1];
    assert!(research.success);
    assert!(!analysis.success);
    assert_eq!(analysis.error_kind(), Some(ErrorKind::AgentExecutionError));
    // Only the successful research result counts.
    assert!((response.overall_confidence - research.confidence).abs() < 1e-6);
}

#[tokio::test]
async fn test_query_deadline_marks_subtasks_timed_out() {
    let config = CoordinatorConfig {
        query_timeout_ms: 100,
        ..Default::default()
    };
    let coordinator = Coordinator::new(config, ephemeral_memory())
        .with_worker(Arc::new(HangingResearch))
        .with_worker(Arc::new(AnalysisAgent::new()));

    let started = std::time::Instant::now();
    let response = coordinator.process_user_query(MULTI_STEP_QUERY).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(response.trace.degraded);
    assert_eq!(response.overall_confidence, 0.0);
    assert!(response.final_answer.starts_with("I was unable to answer"));
    let kinds = response.trace.error_kinds();
    assert_eq!(
        kinds.iter().filter(|k| **k == ErrorKind::Timeout).count(),
        2,
        "{kinds:?}"
    );
}

#[tokio::test]
async fn test_storage_failure_is_soft() {
    let config = MemoryConfig::default();
    let memory = MemorySubsystem::with_backends(
        config.clone(),
        Arc::new(HashingEmbedder::new(config.embedding_dim).unwrap()),
        Arc::new(FileVectorStore::ephemeral()),
        Arc::new(FailingMetadata),
    );
    let coordinator =
        Coordinator::new(CoordinatorConfig::default(), Arc::new(memory)).with_default_agents();

    let response = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();

    assert!(response.trace.degraded);
    assert!(response.record_id.is_none());
    assert!(response
        .trace
        .error_kinds()
        .contains(&ErrorKind::MemoryStorageError));
    assert!(response.overall_confidence > 0.0);
    assert!(response.final_answer.contains("neural networks"));
}

#[tokio::test]
async fn test_empty_query_asks_for_a_question() {
    let coordinator = create_test_coordinator();
    let response = coordinator.process_user_query("   ").await.unwrap();

    assert_eq!(response.overall_confidence, 0.0);
    assert_eq!(response.trace.phases(), vec![Phase::Received, Phase::Done]);
    assert!(response.record_id.is_none());
}

#[tokio::test]
async fn test_confidence_stays_in_unit_interval() {
    let coordinator = create_test_coordinator();
    let queries = [
        SIMPLE_QUERY,
        MULTI_STEP_QUERY,
        "Compare CNNs vs RNNs",
        "How effective is reinforcement learning?",
        "Count the algorithms in machine learning",
        "Tell me about medieval poetry",
    ];
    for query in queries {
        let response = coordinator.process_user_query(query).await.unwrap();
        assert!(
            (0.0..=1.0).contains(&response.overall_confidence),
            "{query}: {}",
            response.overall_confidence
        );
        assert!(!response.final_answer.is_empty());
    }
}

#[tokio::test]
async fn test_agent_state_is_tracked_per_worker() {
    let coordinator = create_test_coordinator();
    coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();

    let state = coordinator.agent_state("research").await.unwrap();
    assert_eq!(state.last_task_id.as_deref(), Some("research_1"));
    assert!(state
        .learned_facts
        .contains(&"topic:neural_networks".to_string()));
}

// ============================================================================
// Hosted model paths
// ============================================================================

#[tokio::test]
async fn test_llm_failure_falls_back_to_rules() {
    let coordinator = create_test_coordinator().with_llm(Arc::new(ScriptedLlm { reply: None }));
    let response = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();

    assert_eq!(plan_source(&response.trace.events), Some(PlanSource::Rules));
    assert!(response
        .trace
        .error_kinds()
        .contains(&ErrorKind::LlmUnavailable));
    assert!(response.trace.was_computed("research_1"));
    assert!(response.overall_confidence > 0.0);
}

#[tokio::test]
async fn test_llm_plan_is_used_when_valid() {
    let reply = r#"{"complexity": "multi_step", "subtasks": [
        {"id": "research_1", "task_type": "research", "instruction": "transformers"},
        {"id": "summary_1", "task_type": "general", "instruction": "summarize", "depends_on": ["research_1"]}
    ]}"#;
    let coordinator = create_test_coordinator().with_llm(Arc::new(ScriptedLlm {
        reply: Some(reply.into()),
    }));

    let response = coordinator.process_user_query(MULTI_STEP_QUERY).await.unwrap();
    assert_eq!(plan_source(&response.trace.events), Some(PlanSource::Llm));
    assert!(response.trace.was_computed("summary_1"));
    assert!(response
        .trace
        .plan_edges()
        .contains(&("research_1".to_string(), "summary_1".to_string())));
}

#[tokio::test]
async fn test_cyclic_plan_is_a_configuration_error() {
    let reply = r#"{"subtasks": [
        {"id": "a", "task_type": "research", "instruction": "x", "depends_on": ["b"]},
        {"id": "b", "task_type": "general", "instruction": "y", "depends_on": ["a"]}
    ]}"#;
    let coordinator = create_test_coordinator().with_llm(Arc::new(ScriptedLlm {
        reply: Some(reply.into()),
    }));

    let err = coordinator
        .process_user_query(MULTI_STEP_QUERY)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    assert!(err.to_string().contains("cycle"));
}

#[tokio::test]
async fn test_duplicate_llm_subtask_ids_fall_back_to_rules() {
    let reply = r#"{"subtasks": [
        {"id": "research_1", "task_type": "research", "instruction": "neural networks"},
        {"id": "research_1", "task_type": "research", "instruction": "deep learning"}
    ]}"#;
    let coordinator = create_test_coordinator().with_llm(Arc::new(ScriptedLlm {
        reply: Some(reply.into()),
    }));

    let response = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    assert_eq!(plan_source(&response.trace.events), Some(PlanSource::Rules));
    assert!(response
        .trace
        .error_kinds()
        .contains(&ErrorKind::LlmUnavailable));
    assert!(response.trace.was_computed("research_1"));
}

#[tokio::test]
async fn test_missing_worker_is_a_configuration_error() {
    let coordinator = Coordinator::new(CoordinatorConfig::default(), ephemeral_memory())
        .with_worker(Arc::new(ResearchAgent::with_mock_knowledge()));

    let err = coordinator
        .process_user_query(MULTI_STEP_QUERY)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_reuse_survives_restart() {
    let dir = TempDir::new().unwrap();
    let memory_config = MemoryConfig {
        storage_path: dir.path().join("memory"),
        ..Default::default()
    };

    {
        let memory = Arc::new(MemorySubsystem::open(memory_config.clone()).await.unwrap());
        let coordinator =
            Coordinator::new(CoordinatorConfig::default(), memory).with_default_agents();
        coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    }

    let memory = Arc::new(MemorySubsystem::open(memory_config).await.unwrap());
    let coordinator = Coordinator::new(CoordinatorConfig::default(), memory).with_default_agents();
    let response = coordinator.process_user_query(SIMPLE_QUERY).await.unwrap();
    assert!(response.trace.was_reused("research_1"));

    let recent = coordinator.memory().recent_conversations(5).await.unwrap();
    assert_eq!(recent.len(), 2);
}
