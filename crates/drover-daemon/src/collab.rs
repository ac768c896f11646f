//! Seams to the collaborators the orchestrator does not own.
//!
//! Argument construction, workspace provisioning, stage context and status
//! persistence live outside this crate; each is reached through a trait so
//! the spawner and pool can be driven by test doubles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use drover_core::AgentStatus;

use crate::spawner::{ProcessInfo, SpawnOptions};

/// Turns spawn options into the agent's argument vector.
///
/// Implementations must be pure: the same options always give the same
/// arguments.
pub trait ArgumentBuilder: Send + Sync {
    fn build_args(&self, options: &SpawnOptions) -> Vec<String>;
}

/// Arguments for the `claude` CLI in headless stream-json mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeArgs;

impl ArgumentBuilder for ClaudeArgs {
    fn build_args(&self, options: &SpawnOptions) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            options.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        let mut flag = |name: &str, value: &str| {
            args.push(name.to_string());
            args.push(value.to_string());
        };

        if let Some(model) = &options.model {
            flag("--model", model);
        }
        if !options.allowed_tools.is_empty() {
            flag("--allowedTools", &options.allowed_tools.join(","));
        }
        if !options.disallowed_tools.is_empty() {
            flag("--disallowedTools", &options.disallowed_tools.join(","));
        }
        if let Some(turns) = options.max_turns {
            flag("--max-turns", &turns.to_string());
        }
        if let Some(session) = &options.resume {
            flag("--resume", session);
        }
        if let Some(prompt) = &options.system_prompt {
            flag("--system-prompt", prompt);
        }
        if let Some(prompt) = &options.append_system_prompt {
            flag("--append-system-prompt", prompt);
        }
        if let Some(mode) = &options.permission_mode {
            flag("--permission-mode", mode);
        }
        args
    }
}

/// Supplies a working directory for an agent that was submitted without one.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn provision(&self, agent_id: &str) -> std::io::Result<PathBuf>;
}

/// One subdirectory per agent under a fixed root.
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl WorkspaceProvisioner for DirectoryProvisioner {
    async fn provision(&self, agent_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.root.join(agent_id);
        tokio::fs::create_dir_all(&dir).await?;
        debug!(agent_id, dir = %dir.display(), "Provisioned agent workspace");
        Ok(dir)
    }
}

/// Read-only access to handed-off context for a workflow stage.
pub trait ContextSource: Send + Sync {
    fn stage_context(&self, stage: &str) -> Option<String>;
}

impl ContextSource for HashMap<String, String> {
    fn stage_context(&self, stage: &str) -> Option<String> {
        self.get(stage).cloned()
    }
}

/// Persists agent status changes. Called on spawn and from the exit path,
/// never from the output loop.
#[async_trait]
pub trait StatusRecorder: Send + Sync {
    async fn record_transition(&self, agent_id: &str, from: AgentStatus, to: AgentStatus);
    async fn record_snapshot(&self, snapshot: &ProcessInfo);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl StatusRecorder for NoopRecorder {
    async fn record_transition(&self, _agent_id: &str, _from: AgentStatus, _to: AgentStatus) {}
    async fn record_snapshot(&self, _snapshot: &ProcessInfo) {}
}

/// A recorded `(agent_id, from, to)` move.
pub type RecordedTransition = (String, AgentStatus, AgentStatus);

/// Keeps everything in memory. Useful for tests and short-lived runs.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    transitions: Mutex<Vec<RecordedTransition>>,
    snapshots: Mutex<Vec<ProcessInfo>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transitions(&self) -> Vec<RecordedTransition> {
        self.transitions.lock().await.clone()
    }

    pub async fn transitions_for(&self, agent_id: &str) -> Vec<(AgentStatus, AgentStatus)> {
        self.transitions
            .lock()
            .await
            .iter()
            .filter(|(id, _, _)| id == agent_id)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub async fn snapshots(&self) -> Vec<ProcessInfo> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl StatusRecorder for MemoryRecorder {
    async fn record_transition(&self, agent_id: &str, from: AgentStatus, to: AgentStatus) {
        self.transitions
            .lock()
            .await
            .push((agent_id.to_string(), from, to));
    }

    async fn record_snapshot(&self, snapshot: &ProcessInfo) {
        self.snapshots.lock().await.push(snapshot.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn claude_args_minimal() {
        let args = ClaudeArgs.build_args(&SpawnOptions::new("a1", "fix the bug"));
        assert_eq!(
            args,
            vec!["-p", "fix the bug", "--output-format", "stream-json", "--verbose"]
        );
    }

    #[test]
    fn claude_args_full() {
        let options = SpawnOptions {
            model: Some("opus".into()),
            allowed_tools: vec!["Read".into(), "Grep".into()],
            disallowed_tools: vec!["Bash".into()],
            max_turns: Some(3),
            resume: Some("sess-1".into()),
            system_prompt: Some("be brief".into()),
            append_system_prompt: Some("and kind".into()),
            permission_mode: Some("plan".into()),
            ..SpawnOptions::new("a1", "go")
        };
        let args = ClaudeArgs.build_args(&options);
        let joined = args.join(" ");
        assert!(joined.starts_with("-p go --output-format stream-json --verbose"));
        for expected in [
            "--model opus",
            "--allowedTools Read,Grep",
            "--disallowedTools Bash",
            "--max-turns 3",
            "--resume sess-1",
            "--system-prompt be brief",
            "--append-system-prompt and kind",
            "--permission-mode plan",
        ] {
            assert!(joined.contains(expected), "missing {expected} in {joined}");
        }
        assert_eq!(args, ClaudeArgs.build_args(&options));
    }

    #[tokio::test]
    async fn directory_provisioner_creates_agent_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = DirectoryProvisioner::new(tmp.path());
        let dir = provisioner.provision("agent-7").await.unwrap();
        assert_eq!(dir, tmp.path().join("agent-7"));
        assert!(dir.is_dir());
    }

    #[test]
    fn map_context_source() {
        let mut ctx = HashMap::new();
        ctx.insert("review".to_string(), "Prior findings".to_string());
        assert_eq!(ctx.stage_context("review").as_deref(), Some("Prior findings"));
        assert_eq!(ctx.stage_context("build"), None);
    }

    #[tokio::test]
    async fn memory_recorder_filters_by_agent() {
        let recorder = MemoryRecorder::new();
        recorder
            .record_transition("a", AgentStatus::Idle, AgentStatus::Working)
            .await;
        recorder
            .record_transition("b", AgentStatus::Idle, AgentStatus::Working)
            .await;
        recorder
            .record_transition("a", AgentStatus::Working, AgentStatus::Completed)
            .await;
        assert_eq!(recorder.transitions().await.len(), 3);
        assert_eq!(
            recorder.transitions_for("a").await,
            vec![
                (AgentStatus::Idle, AgentStatus::Working),
                (AgentStatus::Working, AgentStatus::Completed)
            ]
        );
    }
}
