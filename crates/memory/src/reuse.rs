//! Reuse decision for memory hits.

use crate::types::{MemoryHit, MemoryQuery};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Why a hit may or may not stand in for a fresh computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReuseVerdict {
    Reusable,
    TooDistant { distance: f32, threshold: f32 },
    TopicMismatch,
    /// Entry has no result data to substitute
    NoPayload,
    /// Keyword-fallback hit
    NoDistance,
}

impl ReuseVerdict {
    pub fn is_reusable(&self) -> bool {
        matches!(self, ReuseVerdict::Reusable)
    }
}

/// A hit is reusable iff its distance is within the threshold and its
/// topics overlap the query's topics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReusePolicy {
    pub threshold: f32,
}

impl ReusePolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn for_query(query: &MemoryQuery) -> Self {
        Self::new(query.distance_threshold)
    }

    pub fn evaluate(&self, hit: &MemoryHit, query_topics: &BTreeSet<String>) -> ReuseVerdict {
        let Some(distance) = hit.distance else {
            return ReuseVerdict::NoDistance;
        };
        if distance > self.threshold {
            return ReuseVerdict::TooDistant {
                distance,
                threshold: self.threshold,
            };
        }
        if hit.entry.topics.is_disjoint(query_topics) {
            return ReuseVerdict::TopicMismatch;
        }
        if hit.entry.payload.is_null() {
            return ReuseVerdict::NoPayload;
        }
        ReuseVerdict::Reusable
    }

    /// First reusable hit in `hits`, which are expected in ascending distance.
    pub fn best_reusable<'a>(
        &self,
        hits: &'a [MemoryHit],
        query_topics: &BTreeSet<String>,
    ) -> Option<&'a MemoryHit> {
        hits.iter()
            .find(|hit| self.evaluate(hit, query_topics).is_reusable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KnowledgeEntry;
    use serde_json::json;

    fn hit(topics: &[&str], distance: Option<f32>) -> MemoryHit {
        MemoryHit {
            entry: KnowledgeEntry::new("neural networks", "research")
                .with_topics(topics.iter().copied())
                .with_payload(json!({ "findings": [] }), 0.9),
            distance,
        }
    }

    fn topics(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reusable_within_threshold() {
        let policy = ReusePolicy::new(0.2);
        let verdict = policy.evaluate(&hit(&["neural_networks"], Some(0.05)), &topics(&["neural_networks"]));
        assert_eq!(verdict, ReuseVerdict::Reusable);

        // threshold is inclusive
        let verdict = policy.evaluate(&hit(&["neural_networks"], Some(0.2)), &topics(&["neural_networks"]));
        assert!(verdict.is_reusable());
    }

    #[test]
    fn test_too_distant_never_reused() {
        let policy = ReusePolicy::new(0.2);
        let verdict = policy.evaluate(&hit(&["neural_networks"], Some(0.21)), &topics(&["neural_networks"]));
        assert!(matches!(verdict, ReuseVerdict::TooDistant { .. }));
    }

    #[test]
    fn test_disjoint_topics_never_reused() {
        let policy = ReusePolicy::new(0.2);
        let verdict = policy.evaluate(&hit(&["cooking"], Some(0.0)), &topics(&["neural_networks"]));
        assert_eq!(verdict, ReuseVerdict::TopicMismatch);

        let verdict = policy.evaluate(&hit(&["cooking"], Some(0.0)), &BTreeSet::new());
        assert_eq!(verdict, ReuseVerdict::TopicMismatch);
    }

    #[test]
    fn test_keyword_hits_never_reused() {
        let policy = ReusePolicy::new(2.0);
        let verdict = policy.evaluate(&hit(&["neural_networks"], None), &topics(&["neural_networks"]));
        assert_eq!(verdict, ReuseVerdict::NoDistance);
    }

    #[test]
    fn test_entry_without_payload() {
        let policy = ReusePolicy::new(0.2);
        let mut candidate = hit(&["neural_networks"], Some(0.0));
        candidate.entry.payload = serde_json::Value::Null;
        assert_eq!(
            policy.evaluate(&candidate, &topics(&["neural_networks"])),
            ReuseVerdict::NoPayload
        );
    }

    #[test]
    fn test_best_reusable_skips_decoy() {
        let policy = ReusePolicy::new(0.2);
        let hits = vec![
            hit(&["cooking"], Some(0.0)),
            hit(&["neural_networks"], Some(0.1)),
        ];
        let best = policy.best_reusable(&hits, &topics(&["neural_networks"])).unwrap();
        assert_eq!(best.distance, Some(0.1));
    }
}
