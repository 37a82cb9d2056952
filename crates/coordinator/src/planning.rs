//! Rule-based query analysis and plan validation.
//!
//! The rule-based planner is total: every non-empty query gets a plan with at
//! least one research subtask, which is what the coordinator falls back to
//! whenever the hosted model is absent or misbehaves.

use crate::config::ConfidenceWeights;
use conclave_common::{ConclaveError, Result, Subtask, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Most research subjects split out of one comparative query.
pub const MAX_SUBJECTS: usize = 4;

const COMPARISON_WORDS: &[&str] = &["compare", "versus", "vs", "difference", "better", "best"];
const EFFECTIVENESS_WORDS: &[&str] = &["effective", "effectiveness", "evaluate", "assess"];
const CALCULATION_WORDS: &[&str] = &["calculate", "compute", "count", "average"];
const GENERAL_WORDS: &[&str] = &[
    "analyze", "analyse", "summarize", "summarise", "tradeoffs", "explain",
];

/// Words trimmed from the ends of an extracted comparison subject.
const SUBJECT_FILLER: &[&str] = &[
    "a", "an", "the", "compare", "comparing", "comparison", "of", "between", "difference",
    "differences", "what", "which", "is", "are", "better", "best", "how", "do", "does", "vs",
    "versus", "to", "with", "for", "in", "terms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Simple,
    MultiStep,
    Comparative,
}

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Rules,
    Llm,
}

/// Output of the Analyzed phase.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAnalysis {
    pub complexity: QueryComplexity,
    pub plan: Vec<Subtask>,
    pub source: PlanSource,
}

fn words(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn mentions(words: &[String], vocabulary: &[&str]) -> bool {
    words.iter().any(|w| vocabulary.contains(&w.as_str()))
}

/// Split a comparative query into the things being compared.
pub fn extract_subjects(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let body = lower.rsplit(':').next().unwrap_or(&lower);
    let body = body.trim().trim_end_matches(['?', '.', '!']);

    let mut normalized = format!(" {body} ");
    for separator in [" vs. ", " vs ", " versus ", " and ", " or ", " against ", ",", ";", "/"] {
        normalized = normalized.replace(separator, " | ");
    }

    let mut subjects: Vec<String> = Vec::new();
    for part in normalized.split('|') {
        let tokens: Vec<&str> = part
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
            .filter(|t| !t.is_empty())
            .collect();
        let start = tokens
            .iter()
            .position(|t| !SUBJECT_FILLER.contains(t))
            .unwrap_or(tokens.len());
        let end = tokens
            .iter()
            .rposition(|t| !SUBJECT_FILLER.contains(t))
            .map_or(start, |i| i + 1);
        if start < end {
            let subject = tokens[start..end].join(" ");
            if !subjects.contains(&subject) {
                subjects.push(subject);
            }
        }
    }
    subjects.truncate(MAX_SUBJECTS);
    subjects
}

/// Deterministic plan for `query`. Never fails.
pub fn analyze_with_rules(query: &str, weights: &ConfidenceWeights) -> QueryAnalysis {
    let words = words(query);
    let research = |id: String, instruction: String| {
        Subtask::new(id, TaskType::Research, instruction)
            .with_importance(weights.for_task(TaskType::Research))
    };

    if mentions(&words, COMPARISON_WORDS) {
        let subjects = extract_subjects(query);
        let research_tasks: Vec<Subtask> = if subjects.len() >= 2 {
            subjects
                .into_iter()
                .enumerate()
                .map(|(i, subject)| research(format!("research_{}", i + 1), subject))
                .collect()
        } else {
            vec![research("research_1".into(), query.to_string())]
        };
        let ids: Vec<String> = research_tasks.iter().map(|t| t.id.clone()).collect();
        let mut plan = research_tasks;
        plan.push(
            Subtask::new("comparison_1", TaskType::Comparison, query)
                .depends_on(ids)
                .with_importance(weights.for_task(TaskType::Comparison)),
        );
        return QueryAnalysis {
            complexity: QueryComplexity::Comparative,
            plan,
            source: PlanSource::Rules,
        };
    }

    let lower = query.to_lowercase();
    let analysis_type = if mentions(&words, EFFECTIVENESS_WORDS) {
        Some(TaskType::Effectiveness)
    } else if mentions(&words, CALCULATION_WORDS) || lower.contains("how many") {
        Some(TaskType::Calculation)
    } else if mentions(&words, GENERAL_WORDS) {
        Some(TaskType::General)
    } else {
        None
    };

    let mut plan = vec![research("research_1".into(), query.to_string())];
    let complexity = match analysis_type {
        Some(task_type) => {
            plan.push(
                Subtask::new(format!("{task_type}_1"), task_type, query)
                    .depends_on(["research_1"])
                    .with_importance(weights.for_task(task_type)),
            );
            QueryComplexity::MultiStep
        }
        None => QueryComplexity::Simple,
    };

    QueryAnalysis {
        complexity,
        plan,
        source: PlanSource::Rules,
    }
}

/// Check a plan and return its topological order (Kahn's algorithm).
///
/// Ties are broken by plan position so the order is deterministic. Every
/// violation is a configuration error.
pub fn validate_plan(
    plan: &[Subtask],
    has_worker: impl Fn(TaskType) -> bool,
) -> Result<Vec<String>> {
    if plan.is_empty() {
        return Err(ConclaveError::Configuration("plan has no subtasks".into()));
    }

    let mut position: HashMap<&str, usize> = HashMap::with_capacity(plan.len());
    for (i, task) in plan.iter().enumerate() {
        if position.insert(task.id.as_str(), i).is_some() {
            return Err(ConclaveError::Configuration(format!(
                "duplicate subtask id '{}'",
                task.id
            )));
        }
        if !has_worker(task.task_type) {
            return Err(ConclaveError::Configuration(format!(
                "no worker registered for {} subtask '{}'",
                task.task_type, task.id
            )));
        }
    }

    let mut in_degree = vec![0usize; plan.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.len()];
    for (i, task) in plan.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &task.depends_on {
            let Some(&j) = position.get(dep.as_str()) else {
                return Err(ConclaveError::Configuration(format!(
                    "subtask '{}' depends on unknown subtask '{dep}'",
                    task.id
                )));
            };
            if seen.insert(j) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    // Ready set ordered by plan position.
    let mut ready: BTreeSet<usize> = (0..plan.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(plan.len());
    while let Some(i) = ready.pop_first() {
        order.push(plan[i].id.clone());
        for &k in &dependents[i] {
            in_degree[k] -= 1;
            if in_degree[k] == 0 {
                ready.insert(k);
            }
        }
    }

    if order.len() != plan.len() {
        let mut cyclic: Vec<&str> = plan
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, t)| t.id.as_str())
            .collect();
        cyclic.sort_unstable();
        return Err(ConclaveError::Configuration(format!(
            "plan has a dependency cycle among: {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}

/// `(dependency, dependent)` pairs in plan order.
pub fn plan_edges(plan: &[Subtask]) -> Vec<(String, String)> {
    plan.iter()
        .flat_map(|task| {
            task.depends_on
                .iter()
                .map(move |dep| (dep.clone(), task.id.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(query: &str) -> QueryAnalysis {
        analyze_with_rules(query, &ConfidenceWeights::default())
    }

    fn ids(plan: &[Subtask]) -> Vec<&str> {
        plan.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn simple_query_is_single_research() {
        let analysis = analyze("What are the main types of neural networks?");
        assert_eq!(analysis.complexity, QueryComplexity::Simple);
        assert_eq!(ids(&analysis.plan), vec!["research_1"]);
        assert_eq!(
            analysis.plan[0].instruction,
            "What are the main types of neural networks?"
        );
        assert_eq!(analysis.source, PlanSource::Rules);
    }

    #[test]
    fn comparative_query_researches_each_subject() {
        let analysis = analyze("Compare transformers and neural networks");
        assert_eq!(analysis.complexity, QueryComplexity::Comparative);
        assert_eq!(
            ids(&analysis.plan),
            vec!["research_1", "research_2", "comparison_1"]
        );
        assert_eq!(analysis.plan[0].instruction, "transformers");
        assert_eq!(analysis.plan[1].instruction, "neural networks");
        assert_eq!(analysis.plan[2].depends_on, vec!["research_1", "research_2"]);
        assert_eq!(analysis.plan[2].importance, 1.5);
    }

    #[test]
    fn comparative_without_subjects_keeps_one_research() {
        let analysis = analyze("Which approach is best?");
        assert_eq!(analysis.complexity, QueryComplexity::Comparative);
        assert_eq!(ids(&analysis.plan), vec!["research_1", "comparison_1"]);
    }

    #[test]
    fn analysis_keywords_make_multi_step_plans() {
        let cases = [
            ("How effective is reinforcement learning?", "effectiveness_1"),
            ("How many types of machine learning are there?", "calculation_1"),
            ("Summarize computer vision", "general_1"),
        ];
        for (query, analysis_id) in cases {
            let analysis = analyze(query);
            assert_eq!(analysis.complexity, QueryComplexity::MultiStep, "{query}");
            assert_eq!(ids(&analysis.plan), vec!["research_1", analysis_id]);
            assert_eq!(analysis.plan[1].depends_on, vec!["research_1"]);
        }
    }

    #[test]
    fn subject_extraction_handles_common_phrasings() {
        assert_eq!(
            extract_subjects("What is the difference between CNNs and RNNs?"),
            vec!["cnns", "rnns"]
        );
        assert_eq!(
            extract_subjects("Transformers vs. recurrent networks"),
            vec!["transformers", "recurrent networks"]
        );
        assert_eq!(
            extract_subjects("Which is better for vision: CNNs or transformers?"),
            vec!["cnns", "transformers"]
        );
        assert_eq!(extract_subjects("a, b, c, d, e, f").len(), MAX_SUBJECTS);
    }

    #[test]
    fn validation_returns_dependency_order() {
        let plan = vec![
            Subtask::new("comparison_1", TaskType::Comparison, "c").depends_on(["research_1", "research_2"]),
            Subtask::new("research_2", TaskType::Research, "b"),
            Subtask::new("research_1", TaskType::Research, "a"),
        ];
        let order = validate_plan(&plan, |_| true).unwrap();
        assert_eq!(order, vec!["research_2", "research_1", "comparison_1"]);
        assert_eq!(
            plan_edges(&plan),
            vec![
                ("research_1".to_string(), "comparison_1".to_string()),
                ("research_2".to_string(), "comparison_1".to_string()),
            ]
        );
    }

    #[test]
    fn cycle_is_configuration_error() {
        let plan = vec![
            Subtask::new("a", TaskType::Research, "a").depends_on(["b"]),
            Subtask::new("b", TaskType::General, "b").depends_on(["a"]),
            Subtask::new("c", TaskType::Research, "c"),
        ];
        let err = validate_plan(&plan, |_| true).unwrap_err();
        assert!(matches!(&err, ConclaveError::Configuration(msg) if msg.contains("a, b")));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = vec![Subtask::new("a", TaskType::Research, "a").depends_on(["a"])];
        assert!(validate_plan(&plan, |_| true).is_err());
    }

    #[test]
    fn structural_violations_are_rejected() {
        assert!(validate_plan(&[], |_| true).is_err());

        let duplicate = vec![
            Subtask::new("a", TaskType::Research, "a"),
            Subtask::new("a", TaskType::Research, "b"),
        ];
        assert!(validate_plan(&duplicate, |_| true).is_err());

        let dangling = vec![Subtask::new("a", TaskType::General, "a").depends_on(["missing"])];
        assert!(validate_plan(&dangling, |_| true).is_err());

        let unhandled = vec![Subtask::new("a", TaskType::Calculation, "a")];
        let err = validate_plan(&unhandled, |t| t == TaskType::Research).unwrap_err();
        assert_eq!(err.kind(), conclave_common::ErrorKind::ConfigurationError);
    }
}
