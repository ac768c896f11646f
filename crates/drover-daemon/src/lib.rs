//! Drover Daemon Library
//!
//! Runtime side of the orchestrator:
//! - Agent subprocess spawning with replay-buffered output
//! - Admission-controlled process pool with FIFO or priority queueing
//! - Intervention tracking and answering over stdin
//! - Orchestrator-wide event bus
//! - Collaborator traits for argument building, workspaces, context and
//!   status persistence

pub mod collab;
pub mod events;
pub mod interventions;
pub mod pool;
pub mod replay;
pub mod spawner;

pub use events::{EventBus, OrchestratorEvent, ProcessMetrics};
pub use pool::{Admission, PoolError, ProcessPool, SpawnRequest};
pub use spawner::{AgentSpawner, ProcessHandle, ProcessInfo, SpawnOptions, SpawnerError};
