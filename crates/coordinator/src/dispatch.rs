//! Dependency-aware subtask dispatch.
//!
//! A subtask starts once every dependency has a result (successful or not);
//! independent subtasks run concurrently up to a bound. When the query
//! deadline passes, outstanding work is aborted and every subtask without a
//! result is marked `Timeout`.

use crate::trace::TraceEvent;
use conclave_common::{
    AgentMessage, AgentState, ErrorKind, Subtask, TaskExecutor, TaskResult,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) struct DispatchRequest<'a> {
    pub query: &'a str,
    pub correlation_id: &'a str,
    pub plan: &'a [Subtask],
    /// Worker chosen for each subtask id
    pub assignments: HashMap<String, Arc<dyn TaskExecutor>>,
    /// Results already known before dispatch (memory reuse)
    pub resolved: HashMap<String, TaskResult>,
    pub deadline: Instant,
    pub max_concurrent: usize,
}

pub(crate) struct DispatchOutcome {
    /// One per plan entry, in plan order
    pub results: Vec<TaskResult>,
    pub events: Vec<TraceEvent>,
    pub timed_out: bool,
}

struct Finished {
    task_id: String,
    agent: String,
    outcome: std::result::Result<(conclave_common::Result<TaskResult>, AgentState), JoinError>,
    duration_ms: u64,
}

/// Aborts the wrapped task when dropped, so aborting the `JoinSet` entry
/// also stops the worker running inside it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Build the message for `subtask`, carrying only successful dependency data.
pub(crate) fn build_message(
    query: &str,
    correlation_id: &str,
    subtask: &Subtask,
    recipient: &str,
    done: &HashMap<String, TaskResult>,
) -> AgentMessage {
    let dependencies: Map<String, Value> = subtask
        .depends_on
        .iter()
        .filter_map(|dep| {
            done.get(dep)
                .filter(|r| r.success)
                .map(|r| (dep.clone(), r.data.clone()))
        })
        .collect();

    AgentMessage::new("coordinator", recipient, subtask.task_type, correlation_id).with_payload(
        json!({
            "task_id": subtask.id,
            "query": query,
            "instruction": subtask.instruction,
            "dependencies": dependencies,
        }),
    )
}

pub(crate) async fn dispatch(
    request: DispatchRequest<'_>,
    agent_states: &RwLock<HashMap<String, AgentState>>,
) -> DispatchOutcome {
    let DispatchRequest {
        query,
        correlation_id,
        plan,
        assignments,
        resolved: mut done,
        deadline,
        max_concurrent,
    } = request;

    let mut waiting: Vec<&Subtask> = plan.iter().filter(|t| !done.contains_key(&t.id)).collect();
    let mut events = Vec::new();
    let mut join_set: JoinSet<Finished> = JoinSet::new();
    let mut timed_out = false;

    info!(
        correlation_id = %correlation_id,
        pending = waiting.len(),
        resolved = done.len(),
        max_concurrent,
        "Dispatching subtasks"
    );

    loop {
        let mut i = 0;
        while i < waiting.len() && join_set.len() < max_concurrent.max(1) {
            let ready = waiting[i].depends_on.iter().all(|d| done.contains_key(d));
            if !ready {
                i += 1;
                continue;
            }
            let subtask = waiting.remove(i);
            let Some(worker) = assignments.get(&subtask.id).cloned() else {
                error!(task_id = %subtask.id, "No worker assigned");
                let result = TaskResult::failure(
                    &subtask.id,
                    "coordinator",
                    ErrorKind::AgentExecutionError,
                    format!("no worker assigned to '{}'", subtask.id),
                );
                done.insert(subtask.id.clone(), result);
                continue;
            };

            let agent = worker.name().to_string();
            let message = build_message(query, correlation_id, subtask, &agent, &done);
            let snapshot = agent_states
                .read()
                .await
                .get(&agent)
                .cloned()
                .unwrap_or_else(|| AgentState::new(&agent));
            let task_id = subtask.id.clone();
            debug!(task_id = %task_id, agent = %agent, "Subtask started");

            join_set.spawn(async move {
                let started = StdInstant::now();
                let handle = tokio::spawn(async move {
                    let mut state = snapshot;
                    let result = worker.process_task(&message, &mut state).await;
                    (result, state)
                });
                let mut guard = AbortOnDrop(handle);
                let outcome = (&mut guard.0).await;
                Finished {
                    task_id,
                    agent,
                    outcome,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            });
        }

        if join_set.is_empty() {
            if !waiting.is_empty() {
                error!(
                    correlation_id = %correlation_id,
                    stuck = waiting.len(),
                    "Subtasks can never become ready"
                );
            }
            break;
        }

        match tokio::time::timeout_at(deadline, join_set.join_next()).await {
            Ok(Some(Ok(finished))) => {
                let result = settle(finished, agent_states, &mut events).await;
                done.insert(result.task_id.clone(), result);
            }
            Ok(Some(Err(e))) => {
                // The outer task only fails if it was cancelled; the subtask
                // is filled in as a failure below.
                error!(error = %e, "Dispatch task ended unexpectedly");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    correlation_id = %correlation_id,
                    running = join_set.len(),
                    waiting = waiting.len(),
                    "Query deadline reached, aborting outstanding subtasks"
                );
                timed_out = true;
                join_set.abort_all();
                break;
            }
        }
    }

    let results = plan
        .iter()
        .map(|subtask| match done.remove(&subtask.id) {
            Some(result) => result,
            None => {
                let agent = assignments
                    .get(&subtask.id)
                    .map(|w| w.name().to_string())
                    .unwrap_or_else(|| "coordinator".into());
                let (kind, message) = if timed_out {
                    (ErrorKind::Timeout, "query deadline reached before the subtask finished")
                } else {
                    (ErrorKind::AgentExecutionError, "subtask never completed")
                };
                events.push(TraceEvent::SubtaskFailed {
                    task_id: subtask.id.clone(),
                    agent: agent.clone(),
                    kind,
                    message: message.into(),
                });
                TaskResult::failure(&subtask.id, agent, kind, message)
            }
        })
        .collect();

    DispatchOutcome {
        results,
        events,
        timed_out,
    }
}

/// Turn a finished worker run into exactly one result and fold its state back.
async fn settle(
    finished: Finished,
    agent_states: &RwLock<HashMap<String, AgentState>>,
    events: &mut Vec<TraceEvent>,
) -> TaskResult {
    let Finished {
        task_id,
        agent,
        outcome,
        duration_ms,
    } = finished;

    let result = match outcome {
        Ok((Ok(mut result), state)) => {
            if result.task_id != task_id {
                warn!(
                    expected = %task_id,
                    reported = %result.task_id,
                    "Worker reported a different task id"
                );
                result.task_id = task_id.clone();
            }
            agent_states
                .write()
                .await
                .entry(agent.clone())
                .or_insert_with(|| AgentState::new(&agent))
                .absorb(state);
            result
        }
        Ok((Err(e), _)) => {
            warn!(task_id = %task_id, agent = %agent, error = %e, "Worker execution fault");
            TaskResult::failure(&task_id, &agent, ErrorKind::AgentExecutionError, e.to_string())
        }
        Err(e) => {
            error!(task_id = %task_id, agent = %agent, error = %e, "Worker panicked");
            TaskResult::failure(
                &task_id,
                &agent,
                ErrorKind::AgentExecutionError,
                format!("worker task failed: {e}"),
            )
        }
    };

    if result.success {
        debug!(task_id = %task_id, confidence = result.confidence, duration_ms, "Subtask computed");
        events.push(TraceEvent::Computed {
            task_id,
            agent,
            confidence: result.confidence,
            duration_ms,
        });
    } else {
        let (kind, message) = result
            .error
            .as_ref()
            .map(|e| (e.kind, e.message.clone()))
            .unwrap_or((ErrorKind::AgentExecutionError, "worker reported failure".into()));
        events.push(TraceEvent::SubtaskFailed {
            task_id,
            agent,
            kind,
            message,
        });
    }
    result
}
