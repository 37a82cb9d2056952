//! The execution trace returned with every response.

use crate::planning::{PlanSource, QueryComplexity};
use chrono::{DateTime, Utc};
use conclave_common::ErrorKind;
use conclave_memory::{LookupSource, ReuseVerdict};
use serde::{Deserialize, Serialize};

/// Coordinator state machine, one pass per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Received,
    Analyzed,
    MemoryChecked,
    Planned,
    Dispatching,
    Synthesized,
    Stored,
    Done,
}

/// One memory candidate and the reuse policy's verdict on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateVerdict {
    pub entry_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub verdict: ReuseVerdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Phase {
        phase: Phase,
    },
    /// The hosted model failed or was skipped and the deterministic path was used
    LlmFallback {
        stage: String,
        kind: ErrorKind,
        reason: String,
    },
    PlanCreated {
        complexity: QueryComplexity,
        source: PlanSource,
        subtasks: Vec<String>,
        /// `(dependency, dependent)` pairs
        edges: Vec<(String, String)>,
    },
    MemoryLookup {
        task_id: String,
        lookup: LookupSource,
        candidates: Vec<CandidateVerdict>,
    },
    Reused {
        task_id: String,
        entry_id: String,
        distance: f32,
        confidence: f32,
    },
    Computed {
        task_id: String,
        agent: String,
        confidence: f32,
        duration_ms: u64,
    },
    SubtaskFailed {
        task_id: String,
        agent: String,
        kind: ErrorKind,
        message: String,
    },
    Summarized {
        model: String,
    },
    StorageFailed {
        kind: ErrorKind,
        message: String,
    },
    Stored {
        record_id: String,
        knowledge_entries: usize,
    },
}

/// Decisions made while answering one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub correlation_id: String,
    pub query: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<TraceEvent>,
    /// Set when a soft failure (storage, timeout) affected the response
    pub degraded: bool,
}

impl Trace {
    pub fn new(correlation_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            query: query.into(),
            started_at: Utc::now(),
            finished_at: None,
            events: Vec::new(),
            degraded: false,
        }
    }

    pub fn record(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn phase(&mut self, phase: Phase) {
        if phase == Phase::Done {
            self.finished_at = Some(Utc::now());
        }
        self.record(TraceEvent::Phase { phase });
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Phase { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    pub fn was_reused(&self, task_id: &str) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, TraceEvent::Reused { task_id: id, .. } if id == task_id))
    }

    pub fn was_computed(&self, task_id: &str) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, TraceEvent::Computed { task_id: id, .. } if id == task_id))
    }

    /// Distance of the substituted memory entry, if `task_id` was reused.
    pub fn reuse_distance(&self, task_id: &str) -> Option<f32> {
        self.events.iter().find_map(|e| match e {
            TraceEvent::Reused {
                task_id: id,
                distance,
                ..
            } if id == task_id => Some(*distance),
            _ => None,
        })
    }

    /// Every error kind recorded, in order.
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::LlmFallback { kind, .. }
                | TraceEvent::SubtaskFailed { kind, .. }
                | TraceEvent::StorageFailed { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn plan_edges(&self) -> Vec<(String, String)> {
        self.events
            .iter()
            .find_map(|e| match e {
                TraceEvent::PlanCreated { edges, .. } => Some(edges.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}
