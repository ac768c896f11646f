//! Spawn options, handles and snapshots.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use drover_core::{AgentStatus, OutputRecord};

use crate::replay::{ReplayChannel, ReplaySubscriber};

/// Everything needed to launch one agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub agent_id: String,
    pub prompt: String,
    /// Working directory. The spawner's own directory when unset.
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    /// Session id to resume.
    pub resume: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub permission_mode: Option<String>,
    /// Applied after the spawner's defaults.
    pub env: HashMap<String, String>,
}

impl SpawnOptions {
    pub fn new(agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub const fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Returned by a successful spawn.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub process_id: String,
    pub agent_id: String,
    /// OS pid, when the platform reports one.
    pub pid: Option<u32>,
    output: ReplayChannel<OutputRecord>,
}

impl ProcessHandle {
    pub(crate) const fn new(
        process_id: String,
        agent_id: String,
        pid: Option<u32>,
        output: ReplayChannel<OutputRecord>,
    ) -> Self {
        Self {
            process_id,
            agent_id,
            pid,
            output,
        }
    }

    /// Attach to the output, starting at the oldest retained record.
    pub fn subscribe(&self) -> ReplaySubscriber<OutputRecord> {
        self.output.subscribe()
    }

    pub fn output_closed(&self) -> bool {
        self.output.is_closed()
    }
}

/// Point-in-time view of a tracked process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub process_id: String,
    pub agent_id: String,
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub cwd: PathBuf,
    pub started_at_ms: u64,
    pub last_activity_ms: u64,
    pub total_cost_usd: f64,
    pub exit_code: Option<i32>,
    pub output_closed: bool,
}

impl ProcessInfo {
    /// Finished status and the output channel has been closed.
    pub const fn is_finished(&self) -> bool {
        self.status.is_finished() && self.output_closed
    }
}
