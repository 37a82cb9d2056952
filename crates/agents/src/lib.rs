//! Worker agents for Conclave.
//!
//! - **Research Agent**: resolves `research` subtasks against a [`KnowledgeSource`]
//! - **Analysis Agent**: comparison, effectiveness, calculation and general
//!   analysis over the research results of its dependencies
//!
//! Both implement [`conclave_common::TaskExecutor`], the only interface the
//! coordinator uses to talk to workers.
//!
//! ```text
//!            AgentMessage { task_type, payload }
//!                         │
//!          ┌──────────────┴──────────────┐
//!          ▼                             ▼
//!   ┌─────────────┐              ┌──────────────┐
//!   │  Research   │  research    │   Analysis   │
//!   │   Agent     │──results────▶│    Agent     │
//!   └──────┬──────┘ (via deps)   └──────────────┘
//!          ▼
//!   KnowledgeSource (mock / file)
//! ```

pub mod analysis;
pub mod knowledge;
pub mod research;

pub use analysis::AnalysisAgent;
pub use knowledge::{KnowledgeSource, KnowledgeTopic, MockKnowledgeBase};
pub use research::ResearchAgent;
