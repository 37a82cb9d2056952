//! Query normalization, keyword extraction and topic inference.

use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashSet};

/// Topics that fall back to content keywords keep at most this many.
const MAX_FALLBACK_TOPICS: usize = 5;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "an", "and", "are", "as", "at", "be", "between", "by", "can", "do", "does",
        "for", "from", "give", "how", "i", "in", "into", "is", "it", "its", "me", "main", "most",
        "of", "on", "or", "over", "please", "should", "tell", "than", "that", "the", "their",
        "them", "there", "these", "they", "this", "to", "use", "used", "using", "vs", "versus",
        "was", "what", "when", "where", "which", "who", "why", "will", "with", "would", "you",
        "your", "type", "kind", "some", "any", "all",
    ]
    .into_iter()
    .collect()
});

/// Topic name to the phrases that indicate it. Phrases are matched on
/// normalized tokens, so `neural networks` matches `neural network`.
const TOPIC_LEXICON: &[(&str, &[&str])] = &[
    (
        "neural_networks",
        &[
            "neural network",
            "neural net",
            "deep learning",
            "cnn",
            "rnn",
            "lstm",
            "perceptron",
            "backpropagation",
        ],
    ),
    (
        "machine_learning",
        &[
            "machine learning",
            "supervised",
            "unsupervised",
            "classification",
            "regression",
            "clustering",
        ],
    ),
    (
        "transformers",
        &["transformer", "attention", "bert", "gpt", "self attention"],
    ),
    (
        "reinforcement_learning",
        &[
            "reinforcement learning",
            "reinforcement",
            "reward",
            "q learning",
            "policy gradient",
        ],
    ),
    (
        "computer_vision",
        &[
            "computer vision",
            "image",
            "object detection",
            "segmentation",
            "vision",
        ],
    ),
];

/// Lowercase, collapse whitespace and strip trailing punctuation.
pub fn normalize_query(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim_end()
        .to_string()
}

/// Lowercased alphanumeric tokens with light plural normalization.
///
/// Stop words are kept; callers filter with [`is_stop_word`].
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let lower = t.to_lowercase();
            if is_stop_word(&lower) {
                lower
            } else {
                singularize(&lower)
            }
        })
        .collect()
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(token)
}

fn singularize(token: &str) -> String {
    if token.len() > 4 && token.ends_with("ies") {
        return format!("{}y", &token[..token.len() - 3]);
    }
    if token.len() > 3
        && token.ends_with('s')
        && !token.ends_with("ss")
        && !token.ends_with("us")
        && !token.ends_with("is")
    {
        return token[..token.len() - 1].to_string();
    }
    token.to_string()
}

/// Content-bearing tokens of `text`.
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.len() >= 3 && !is_stop_word(t))
        .collect()
}

/// Topics from the lexicon, or the leading content keywords if none match.
pub fn infer_topics(text: &str) -> BTreeSet<String> {
    let tokens = tokenize(text);
    let haystack = format!(" {} ", tokens.join(" "));

    let topics: BTreeSet<String> = TOPIC_LEXICON
        .iter()
        .filter(|(_, phrases)| {
            phrases.iter().any(|phrase| {
                let needle = format!(" {} ", tokenize(phrase).join(" "));
                haystack.contains(&needle)
            })
        })
        .map(|(topic, _)| topic.to_string())
        .collect();

    if !topics.is_empty() {
        return topics;
    }

    let mut seen = BTreeSet::new();
    tokens
        .into_iter()
        .filter(|t| t.len() >= 3 && !is_stop_word(t))
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_FALLBACK_TOPICS)
        .collect()
}
