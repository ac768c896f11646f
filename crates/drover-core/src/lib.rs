//! `Drover` Core Library
//!
//! Shared functionality for `Drover` components:
//! - Table-driven state machines for agents, features, sessions and worktrees
//! - Incremental NDJSON parsing of the agent stream-json protocol
//! - Canonical output records and intervention types
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod intervention;
pub mod ndjson;
pub mod output;
pub mod state;
pub mod tracing_init;

pub use config::{Config, QueueStrategy};
pub use error::{Error, Result};
pub use intervention::{InterventionKind, InterventionRequest, InterventionStatus};
pub use output::{OutputBody, OutputKind, OutputRecord};
pub use state::{AgentStatus, FeatureStatus, SessionStatus, StateMachine, WorktreeStatus};
