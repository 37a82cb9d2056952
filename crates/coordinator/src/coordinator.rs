//! The per-query state machine.

use crate::config::CoordinatorConfig;
use crate::decompose::decompose_with_llm;
use crate::dispatch::{dispatch, DispatchRequest};
use crate::planning::{analyze_with_rules, plan_edges, validate_plan, QueryAnalysis};
use crate::synthesis::{aggregate_confidence, compose_answer, summarize_with_llm};
use crate::trace::{CandidateVerdict, Phase, Trace, TraceEvent};
use conclave_agents::{AnalysisAgent, KnowledgeSource, MockKnowledgeBase, ResearchAgent};
use conclave_common::{
    AgentState, ConclaveError, ErrorKind, Result, Subtask, TaskExecutor, TaskResult, TaskType,
};
use conclave_llm::{build_llm_client, LlmClient};
use conclave_memory::{
    ConversationRecord, KnowledgeEntry, LookupSource, MemorySubsystem, ReusePolicy,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Agent name recorded on results substituted from memory.
pub const MEMORY_AGENT: &str = "memory";

/// What the caller gets back for every query that is not a configuration error.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub final_answer: String,
    pub trace: Trace,
    pub overall_confidence: f32,
    /// Id of the stored conversation record, absent when storage failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Plans a query, reuses or computes each subtask, and synthesizes an answer.
///
/// Holds an explicit [`MemorySubsystem`] handle; the workers are looked up by
/// task type in registration order.
pub struct Coordinator {
    config: CoordinatorConfig,
    memory: Arc<MemorySubsystem>,
    workers: Vec<Arc<dyn TaskExecutor>>,
    llm: Option<Arc<dyn LlmClient>>,
    agent_states: RwLock<HashMap<String, AgentState>>,
}

impl Coordinator {
    /// A coordinator with no workers and no LLM client.
    pub fn new(config: CoordinatorConfig, memory: Arc<MemorySubsystem>) -> Self {
        Self {
            config,
            memory,
            workers: Vec::new(),
            llm: None,
            agent_states: RwLock::new(HashMap::new()),
        }
    }

    /// Build everything from configuration: file-backed memory, the default
    /// workers and, when credentials are available, the hosted LLM client.
    pub async fn from_config(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        info!(
            storage_path = %config.memory.storage_path.display(),
            query_timeout_ms = config.query_timeout_ms,
            "Initializing coordinator"
        );

        let memory = Arc::new(MemorySubsystem::open(config.memory.clone()).await?);
        let knowledge: Arc<dyn KnowledgeSource> = match &config.knowledge_base_path {
            Some(path) => Arc::new(MockKnowledgeBase::from_file(path).await?),
            None => Arc::new(MockKnowledgeBase::default()),
        };
        let llm = build_llm_client(&config.llm)?;
        if llm.is_none() {
            info!("No LLM credentials configured, using rule-based planning");
        }

        let mut coordinator = Self::new(config, memory)
            .with_worker(Arc::new(ResearchAgent::new(knowledge)))
            .with_worker(Arc::new(AnalysisAgent::new()));
        coordinator.llm = llm;
        Ok(coordinator)
    }

    /// Register the research and analysis agents over the built-in knowledge base.
    pub fn with_default_agents(self) -> Self {
        self.with_worker(Arc::new(ResearchAgent::with_mock_knowledge()))
            .with_worker(Arc::new(AnalysisAgent::new()))
    }

    pub fn with_worker(mut self, worker: Arc<dyn TaskExecutor>) -> Self {
        self.register(worker);
        self
    }

    pub fn register(&mut self, worker: Arc<dyn TaskExecutor>) {
        info!(agent = %worker.name(), "Registered worker");
        self.workers.push(worker);
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemorySubsystem> {
        &self.memory
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Snapshot of a worker's state after the queries run so far.
    pub async fn agent_state(&self, name: &str) -> Option<AgentState> {
        self.agent_states.read().await.get(name).cloned()
    }

    fn worker_for(&self, task_type: TaskType) -> Option<&Arc<dyn TaskExecutor>> {
        self.workers.iter().find(|w| w.handles(task_type))
    }

    /// Answer one query.
    ///
    /// Only a configuration error (an invalid plan) is returned as `Err`;
    /// every other failure is recorded in the trace and degrades the answer.
    #[instrument(skip(self, query), fields(query_id))]
    pub async fn process_user_query(&self, query: &str) -> Result<Response> {
        let correlation_id = format!("query_{}", uuid::Uuid::new_v4());
        tracing::Span::current().record("query_id", correlation_id.as_str());
        let deadline = Instant::now() + self.config.query_timeout();

        let mut trace = Trace::new(&correlation_id, query);
        trace.phase(Phase::Received);
        info!(
            query_id = %correlation_id,
            query_preview = %query.chars().take(60).collect::<String>(),
            "Received query"
        );

        let query = query.trim();
        if query.is_empty() {
            trace.phase(Phase::Done);
            return Ok(Response {
                final_answer: "Please ask a question.".into(),
                trace,
                overall_confidence: 0.0,
                record_id: None,
            });
        }

        let analysis = self.analyze(query, &mut trace).await;
        trace.phase(Phase::Analyzed);
        let QueryAnalysis {
            complexity,
            plan,
            source,
        } = analysis;

        let resolved = if self.config.enable_reuse {
            self.check_memory(&plan, deadline, &mut trace).await
        } else {
            HashMap::new()
        };
        trace.phase(Phase::MemoryChecked);

        let order = match validate_plan(&plan, |t| self.worker_for(t).is_some()) {
            Ok(order) => order,
            Err(e) => {
                error!(query_id = %correlation_id, error = %e, "Invalid plan");
                return Err(e);
            }
        };
        debug!(query_id = %correlation_id, order = ?order, "Plan validated");
        trace.record(TraceEvent::PlanCreated {
            complexity,
            source,
            subtasks: plan.iter().map(|t| t.id.clone()).collect(),
            edges: plan_edges(&plan),
        });
        trace.phase(Phase::Planned);

        let assignments = plan
            .iter()
            .filter(|t| !resolved.contains_key(&t.id))
            .filter_map(|t| self.worker_for(t.task_type).map(|w| (t.id.clone(), w.clone())))
            .collect();

        trace.phase(Phase::Dispatching);
        let outcome = dispatch(
            DispatchRequest {
                query,
                correlation_id: &correlation_id,
                plan: &plan,
                assignments,
                resolved,
                deadline,
                max_concurrent: self.config.max_concurrent_subtasks,
            },
            &self.agent_states,
        )
        .await;
        for event in outcome.events {
            trace.record(event);
        }
        if outcome.timed_out {
            trace.mark_degraded();
        }
        let results = outcome.results;

        let overall_confidence = aggregate_confidence(&plan, &results);
        let final_answer = self
            .synthesize(query, &plan, &results, overall_confidence, &mut trace)
            .await;
        trace.phase(Phase::Synthesized);

        let record_id = self
            .store(query, &plan, &results, &final_answer, overall_confidence, &mut trace)
            .await;
        trace.phase(Phase::Stored);

        info!(
            query_id = %correlation_id,
            confidence = overall_confidence,
            degraded = trace.degraded,
            "Query complete"
        );
        trace.phase(Phase::Done);

        Ok(Response {
            final_answer,
            trace,
            overall_confidence,
            record_id,
        })
    }

    /// LLM decomposition when available, otherwise the rule-based plan.
    async fn analyze(&self, query: &str, trace: &mut Trace) -> QueryAnalysis {
        let Some(client) = &self.llm else {
            return analyze_with_rules(query, &self.config.weights);
        };

        match decompose_with_llm(
            client.as_ref(),
            query,
            &self.config.weights,
            self.config.llm.timeout(),
        )
        .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(error = %e, "LLM planning failed, using rule-based plan");
                trace.record(TraceEvent::LlmFallback {
                    stage: "planning".into(),
                    kind: ErrorKind::LlmUnavailable,
                    reason: e.to_string(),
                });
                analyze_with_rules(query, &self.config.weights)
            }
        }
    }

    /// Look up every research subtask and keep the reusable hits.
    async fn check_memory(
        &self,
        plan: &[Subtask],
        deadline: Instant,
        trace: &mut Trace,
    ) -> HashMap<String, TaskResult> {
        let mut resolved = HashMap::new();

        for subtask in plan.iter().filter(|t| t.task_type == TaskType::Research) {
            let query = self.memory.query_for(&subtask.instruction);
            let topics = self.memory.infer_topics(&subtask.instruction);
            let policy = ReusePolicy::for_query(&query);

            let lookup = match tokio::time::timeout_at(deadline, self.memory.lookup(&query)).await
            {
                Ok(lookup) => lookup,
                Err(_) => {
                    warn!(task_id = %subtask.id, "Query deadline reached during memory check");
                    trace.record(TraceEvent::MemoryLookup {
                        task_id: subtask.id.clone(),
                        lookup: LookupSource::Unavailable {
                            reason: "query deadline reached".into(),
                        },
                        candidates: Vec::new(),
                    });
                    break;
                }
            };

            if let LookupSource::KeywordFallback { reason } | LookupSource::Unavailable { reason } =
                &lookup.source
            {
                debug!(task_id = %subtask.id, reason = %reason, "Memory lookup degraded");
            }

            let candidates = lookup
                .hits
                .iter()
                .map(|hit| CandidateVerdict {
                    entry_id: hit.entry.id.clone(),
                    distance: hit.distance,
                    verdict: policy.evaluate(hit, &topics),
                })
                .collect();
            trace.record(TraceEvent::MemoryLookup {
                task_id: subtask.id.clone(),
                lookup: lookup.source.clone(),
                candidates,
            });

            let Some(hit) = policy.best_reusable(&lookup.hits, &topics) else {
                continue;
            };
            let Some(distance) = hit.distance else {
                continue;
            };
            let confidence = (hit.entry.confidence * (1.0 - distance)).clamp(0.0, 1.0);
            info!(
                task_id = %subtask.id,
                entry_id = %hit.entry.id,
                distance,
                confidence,
                "Reusing stored result"
            );
            trace.record(TraceEvent::Reused {
                task_id: subtask.id.clone(),
                entry_id: hit.entry.id.clone(),
                distance,
                confidence,
            });
            resolved.insert(
                subtask.id.clone(),
                TaskResult::success(&subtask.id, MEMORY_AGENT, hit.entry.payload.clone(), confidence),
            );
        }
        resolved
    }

    async fn synthesize(
        &self,
        query: &str,
        plan: &[Subtask],
        results: &[TaskResult],
        overall_confidence: f32,
        trace: &mut Trace,
    ) -> String {
        let draft = compose_answer(query, plan, results, overall_confidence);

        let any_success = results.iter().any(|r| r.success);
        let client = match &self.llm {
            Some(client) if self.config.llm.summarize && any_success => client,
            _ => return draft,
        };

        match summarize_with_llm(client.as_ref(), query, &draft, self.config.llm.timeout()).await {
            Ok(text) => {
                trace.record(TraceEvent::Summarized {
                    model: client.model_name().to_string(),
                });
                text
            }
            Err(e) => {
                warn!(error = %e, "LLM summary failed, keeping composed answer");
                trace.record(TraceEvent::LlmFallback {
                    stage: "summary".into(),
                    kind: ErrorKind::LlmUnavailable,
                    reason: e.to_string(),
                });
                draft
            }
        }
    }

    /// Persist fresh research as knowledge, then the conversation record.
    ///
    /// Failures are soft: logged, recorded, and the trace is marked degraded.
    async fn store(
        &self,
        query: &str,
        plan: &[Subtask],
        results: &[TaskResult],
        final_answer: &str,
        overall_confidence: f32,
        trace: &mut Trace,
    ) -> Option<String> {
        let by_id: HashMap<&str, &Subtask> = plan.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut stored_knowledge = 0;

        for result in results {
            if !result.success || result.confidence <= 0.0 || result.agent_name == MEMORY_AGENT {
                continue;
            }
            let Some(subtask) = by_id.get(result.task_id.as_str()) else {
                continue;
            };
            if subtask.task_type != TaskType::Research {
                continue;
            }

            let entry = KnowledgeEntry::new(&subtask.instruction, "research")
                .with_payload(result.data.clone(), result.confidence)
                .with_task(&result.task_id);
            match self.memory.store(entry).await {
                Ok(id) => {
                    debug!(task_id = %result.task_id, entry_id = %id, "Stored knowledge entry");
                    stored_knowledge += 1;
                }
                Err(e) => self.storage_failed(trace, e.into()),
            }
        }

        let record = ConversationRecord::new(
            query,
            plan.to_vec(),
            results.to_vec(),
            final_answer,
            overall_confidence,
        );
        match self.memory.store(record).await {
            Ok(record_id) => {
                trace.record(TraceEvent::Stored {
                    record_id: record_id.clone(),
                    knowledge_entries: stored_knowledge,
                });
                Some(record_id)
            }
            Err(e) => {
                self.storage_failed(trace, e.into());
                None
            }
        }
    }

    fn storage_failed(&self, trace: &mut Trace, err: ConclaveError) {
        warn!(error = %err, "Storing to memory failed, response is degraded");
        trace.record(TraceEvent::StorageFailed {
            kind: ErrorKind::MemoryStorageError,
            message: err.to_string(),
        });
        trace.mark_degraded();
    }
}
