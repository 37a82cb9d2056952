//! Common types and traits shared across Conclave crates.
//!
//! This crate provides the data contracts the coordinator, the memory
//! subsystem and the workers use to talk to each other.

pub mod error;
pub mod message;
pub mod task;
pub mod traits;

pub use error::{ConclaveError, ErrorKind, Result};
pub use message::{AgentMessage, TaskType};
pub use task::{Subtask, TaskError, TaskResult};
pub use traits::{AgentState, TaskExecutor};
