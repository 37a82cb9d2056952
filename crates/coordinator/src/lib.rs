//! Query coordinator for Conclave.
//!
//! The coordinator is the central brain that:
//! 1. Receives a user query
//! 2. Plans it, with the hosted model when available and keyword rules otherwise
//! 3. Substitutes stored research for subtasks the memory can answer
//! 4. Dispatches the rest to workers in dependency order
//! 5. Synthesizes an answer, weighting confidence by subtask importance
//! 6. Stores what it learned
//!
//! # Architecture
//!
//! ```text
//! User Query
//!      │
//!      ▼
//! ┌─────────────────┐   plan    ┌───────────┐
//! │   Coordinator   │◄─────────►│ LLM (opt) │
//! │   (this crate)  │           └───────────┘
//! └───┬─────────┬───┘
//!     │ reuse   │ AgentMessage / TaskResult
//!     ▼         ├──────────────┐
//! [Memory]  [Research]   [Analysis]
//!            Agent         Agent
//! ```

pub mod config;
pub mod coordinator;
pub mod decompose;
mod dispatch;
pub mod planning;
pub mod synthesis;
pub mod trace;

pub use config::{ConfidenceWeights, CoordinatorConfig};
pub use coordinator::{Coordinator, Response, MEMORY_AGENT};
pub use planning::{PlanSource, QueryAnalysis, QueryComplexity};
pub use trace::{CandidateVerdict, Phase, Trace, TraceEvent};
