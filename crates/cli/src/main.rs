//! Conclave command-line front-end.
//!
//! Usage:
//!   conclave "What are the main types of neural networks?"
//!   conclave --config conclave.toml "Compare CNNs vs RNNs"
//!   conclave --scenarios --no-llm
//!   conclave --json "Explain the tradeoffs of transformers"
//!
//! # Environment Variables
//!
//! - `CONCLAVE_LLM_API_KEY` / `GROQ_API_KEY` / `OPENAI_API_KEY` - hosted model credential
//! - `CONCLAVE_STORAGE_PATH` - memory storage directory
//! - `CONCLAVE_DISTANCE_THRESHOLD` - reuse distance cutoff
//! - `CONCLAVE_CACHE_SIZE` - query cache bound
//! - `CONCLAVE_QUERY_TIMEOUT_MS` - per-query deadline
//! - `RUST_LOG` - log filter (default `info,conclave=debug`)

use anyhow::{bail, Context};
use clap::Parser;
use conclave_coordinator::{Coordinator, CoordinatorConfig, Response, TraceEvent};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Built-in demonstration queries, run in order on one coordinator.
const SCENARIOS: &[(&str, &str)] = &[
    ("simple", "What are the main types of neural networks?"),
    ("memory repeat", "What are the main types of neural networks?"),
    ("multi-step", "Explain the tradeoffs of transformers"),
    ("comparative", "Compare CNNs vs RNNs"),
];

#[derive(Parser, Debug)]
#[command(name = "conclave", version)]
#[command(about = "Answer questions with a memory-backed multi-agent coordinator")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "CONCLAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Memory storage directory (overrides the config file)
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Plan with keyword rules only, even if a credential is configured
    #[arg(long)]
    no_llm: bool,

    /// JSON logs and JSON responses
    #[arg(long)]
    json: bool,

    /// Run the built-in scenario set
    #[arg(long)]
    scenarios: bool,

    /// Queries to answer, in order
    queries: Vec<String>,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,conclave=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match &cli.config {
        Some(path) => CoordinatorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = CoordinatorConfig::default();
            config.apply_env()?;
            config
        }
    };

    if let Some(storage) = &cli.storage {
        config.memory.storage_path = storage.clone();
    }
    if cli.no_llm {
        config.llm.enabled = false;
    }
    Ok(config)
}

fn describe_event(event: &TraceEvent) -> Option<String> {
    let line = match event {
        TraceEvent::Phase { .. } => return None,
        TraceEvent::LlmFallback { stage, kind, reason } => {
            format!("{stage}: {kind}, fell back ({reason})")
        }
        TraceEvent::PlanCreated {
            complexity,
            source,
            subtasks,
            edges,
        } => {
            let edges: Vec<String> = edges.iter().map(|(a, b)| format!("{a} -> {b}")).collect();
            format!(
                "plan ({complexity:?}, {source:?}): {} [{}]",
                subtasks.join(", "),
                edges.join(", ")
            )
        }
        TraceEvent::MemoryLookup {
            task_id,
            lookup,
            candidates,
        } => format!(
            "{task_id}: memory lookup via {lookup:?}, {} candidate(s)",
            candidates.len()
        ),
        TraceEvent::Reused {
            task_id,
            entry_id,
            distance,
            confidence,
        } => format!(
            "{task_id}: reused {entry_id} (distance {distance:.3}, confidence {confidence:.2})"
        ),
        TraceEvent::Computed {
            task_id,
            agent,
            confidence,
            duration_ms,
        } => format!(
            "{task_id}: computed by {agent} in {duration_ms}ms (confidence {confidence:.2})"
        ),
        TraceEvent::SubtaskFailed {
            task_id,
            agent,
            kind,
            message,
        } => format!("{task_id}: {agent} failed with {kind}: {message}"),
        TraceEvent::Summarized { model } => format!("answer rewritten by {model}"),
        TraceEvent::StorageFailed { kind, message } => format!("storage: {kind}: {message}"),
        TraceEvent::Stored {
            record_id,
            knowledge_entries,
        } => format!("stored {record_id} with {knowledge_entries} knowledge entr(ies)"),
    };
    Some(line)
}

fn render(label: Option<&str>, response: &Response, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    if let Some(label) = label {
        println!("=== {label} ===");
    }
    println!("{}", response.final_answer);
    println!();
    println!(
        "confidence: {:.2}{}",
        response.overall_confidence,
        if response.trace.degraded { " (degraded)" } else { "" }
    );
    println!("trace {}:", response.trace.correlation_id);
    for line in response.trace.events.iter().filter_map(describe_event) {
        println!("  - {line}");
    }
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let queries: Vec<(Option<&str>, &str)> = if cli.scenarios {
        SCENARIOS.iter().map(|(label, q)| (Some(*label), *q)).collect()
    } else {
        cli.queries.iter().map(|q| (None, q.as_str())).collect()
    };
    if queries.is_empty() {
        bail!("no query given; pass one or more queries, or --scenarios");
    }

    let config = load_config(&cli)?;
    let coordinator = Coordinator::from_config(config)
        .await
        .context("starting coordinator")?;

    for (label, query) in queries {
        let response = coordinator
            .process_user_query(query)
            .await
            .with_context(|| format!("query failed: {query}"))?;
        render(label, &response, cli.json)?;
    }

    let stats = coordinator.memory().stats().await?;
    tracing::info!(
        knowledge_entries = stats.knowledge_entries,
        conversations = stats.conversations,
        cached_queries = stats.cached_queries,
        "Session finished"
    );
    Ok(())
}
