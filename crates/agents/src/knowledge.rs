//! Knowledge sources the research agent searches.

use async_trait::async_trait;
use conclave_common::{ConclaveError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// A named topic and its structured facts.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeTopic {
    /// Snake-case name, e.g. `neural_networks`
    pub name: String,
    pub data: Value,
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;

    async fn topics(&self) -> Result<Vec<KnowledgeTopic>>;
}

/// In-memory knowledge base of `topic -> JSON object`.
#[derive(Debug, Clone)]
pub struct MockKnowledgeBase {
    topics: BTreeMap<String, Value>,
}

impl MockKnowledgeBase {
    /// Build from a JSON object whose values are objects.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ConclaveError::Configuration(
                "knowledge base must be a JSON object of topics".into(),
            ));
        };

        let mut topics = BTreeMap::new();
        for (name, data) in map {
            if !data.is_object() {
                return Err(ConclaveError::Configuration(format!(
                    "knowledge topic '{name}' must be a JSON object"
                )));
            }
            topics.insert(name, data);
        }
        Ok(Self { topics })
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let value: Value = serde_json::from_str(&raw)?;
        let kb = Self::from_value(value)?;
        info!(path = %path.display(), topics = kb.topics.len(), "Loaded knowledge base");
        Ok(kb)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl Default for MockKnowledgeBase {
    fn default() -> Self {
        let mut topics = Map::new();
        topics.insert(
            "neural_networks".into(),
            json!({
                "types": ["CNN", "RNN", "LSTM", "GRU", "Transformer"],
                "applications": ["image recognition", "NLP", "time series"],
                "description": "Neural networks are computing systems inspired by biological neural networks"
            }),
        );
        topics.insert(
            "machine_learning".into(),
            json!({
                "algorithms": ["SVM", "Random Forest", "Gradient Boosting", "Neural Networks"],
                "types": ["supervised", "unsupervised", "reinforcement"],
                "optimization": ["gradient descent", "adam", "rmsprop", "adagrad"]
            }),
        );
        topics.insert(
            "transformers".into(),
            json!({
                "architectures": ["BERT", "GPT", "T5", "BART"],
                "efficiency": { "BERT": "high memory", "GPT": "autoregressive", "T5": "text-to-text" },
                "tradeoffs": "computational cost vs performance"
            }),
        );
        topics.insert(
            "reinforcement_learning".into(),
            json!({
                "algorithms": ["Q-learning", "SARSA", "PPO", "DQN"],
                "concepts": ["reward", "policy", "value function", "exploration"],
                "applications": ["game playing", "robotics"]
            }),
        );
        topics.insert(
            "computer_vision".into(),
            json!({
                "tasks": ["image classification", "object detection", "segmentation"],
                "models": ["ResNet", "YOLO", "ViT"],
                "efficiency": { "YOLO": "real-time", "ViT": "data hungry" }
            }),
        );

        Self {
            topics: topics.into_iter().collect(),
        }
    }
}

#[async_trait]
impl KnowledgeSource for MockKnowledgeBase {
    fn name(&self) -> &str {
        "mock"
    }

    async fn topics(&self) -> Result<Vec<KnowledgeTopic>> {
        Ok(self
            .topics
            .iter()
            .map(|(name, data)| KnowledgeTopic {
                name: name.clone(),
                data: data.clone(),
            })
            .collect())
    }
}
