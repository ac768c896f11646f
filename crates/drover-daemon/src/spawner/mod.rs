//! Agent subprocess spawner.
//!
//! Owns the OS processes of running agents. Each spawn wires four tasks:
//! a stdin writer, a stdout consumer that parses the NDJSON stream, a stderr
//! consumer, and an exit watcher that settles the final status and closes the
//! replay-buffered output channel.

mod tasks;
mod types;

pub use types::{ProcessHandle, ProcessInfo, SpawnOptions};

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use drover_core::config::SpawnerConfig;
use drover_core::output::now_millis;
use drover_core::state::AGENT;
use drover_core::{AgentStatus, InterventionRequest, OutputRecord};

use crate::collab::{ArgumentBuilder, ClaudeArgs, NoopRecorder, StatusRecorder};
use crate::events::{EventBus, OrchestratorEvent};
use crate::interventions::InterventionRegistry;
use crate::replay::{ReplayChannel, ReplaySubscriber};
use tasks::{ExitSignals, ProcessContext, ProcessMeta};

/// Environment forced on every agent so its output stays machine-readable.
const PLAIN_OUTPUT_ENV: [(&str, &str); 4] = [
    ("NO_COLOR", "1"),
    ("FORCE_COLOR", "0"),
    ("CLICOLOR", "0"),
    ("TERM", "dumb"),
];

struct ProcessEntry {
    ctx: Arc<ProcessContext>,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<i32>>,
    settled_rx: watch::Receiver<bool>,
}

/// Spawner for agent processes.
#[derive(Clone)]
pub struct AgentSpawner {
    /// Tracked processes keyed by process ID.
    processes: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    config: Arc<SpawnerConfig>,
    args: Arc<dyn ArgumentBuilder>,
    recorder: Arc<dyn StatusRecorder>,
    events: EventBus,
    interventions: InterventionRegistry,
}

impl AgentSpawner {
    pub fn new(config: SpawnerConfig, events: EventBus) -> Self {
        info!(
            agent_bin = %config.agent_bin,
            replay_capacity = config.replay_capacity,
            "AgentSpawner created"
        );
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            args: Arc::new(ClaudeArgs),
            recorder: Arc::new(NoopRecorder),
            events,
            interventions: InterventionRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_argument_builder(mut self, args: Arc<dyn ArgumentBuilder>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn StatusRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub const fn interventions(&self) -> &InterventionRegistry {
        &self.interventions
    }

    /// Launch an agent process.
    ///
    /// Fails with [`SpawnerError::AgentBusy`] while the agent already has an
    /// unfinished process, and with [`SpawnerError::SpawnFailed`] when the OS
    /// process cannot be created. No process id is allocated on failure.
    pub async fn spawn(&self, options: SpawnOptions) -> Result<ProcessHandle, SpawnerError> {
        let mut processes = self.processes.write().await;
        for entry in processes.values() {
            if entry.ctx.agent_id == options.agent_id && !entry.ctx.is_finished().await {
                return Err(SpawnerError::AgentBusy {
                    agent_id: options.agent_id,
                });
            }
        }

        let cwd = match &options.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| SpawnerError::SpawnFailed {
                reason: format!("Cannot resolve working directory: {e}"),
            })?,
        };

        let args = self.args.build_args(&options);
        let mut cmd = Command::new(&self.config.agent_bin);
        cmd.args(&args)
            .current_dir(&cwd)
            .envs(PLAIN_OUTPUT_ENV)
            .envs(&self.config.env)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            agent_id = %options.agent_id,
            agent_bin = %self.config.agent_bin,
            cwd = %cwd.display(),
            args = args.len(),
            "Spawning agent subprocess"
        );
        let mut child = cmd.spawn().map_err(|e| SpawnerError::SpawnFailed {
            reason: format!("{}: {e}", self.config.agent_bin),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill half-spawned agent");
            }
            return Err(SpawnerError::SpawnFailed {
                reason: "Failed to capture stdio".to_string(),
            });
        };

        let process_id = uuid::Uuid::new_v4().to_string();
        let pid = child.id();

        let mut meta = ProcessMeta::new();
        let started = match AGENT.apply(&mut meta, AgentStatus::Working) {
            Ok(from) => Some((from, AgentStatus::Working)),
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Agent not moved to working");
                None
            }
        };

        let ctx = Arc::new(ProcessContext {
            process_id: process_id.clone(),
            agent_id: options.agent_id.clone(),
            pid,
            cwd,
            started_at_ms: now_millis(),
            meta: RwLock::new(meta),
            output: ReplayChannel::new(self.config.replay_capacity),
            events: self.events.clone(),
            interventions: self.interventions.clone(),
            recorder: Arc::clone(&self.recorder),
            kill_requested: AtomicBool::new(false),
        });

        let (stdin_tx, stdin_rx) = mpsc::channel(self.config.stdin_buffer.max(1));
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (settled_tx, settled_rx) = watch::channel(false);

        processes.insert(
            process_id.clone(),
            ProcessEntry {
                ctx: Arc::clone(&ctx),
                stdin_tx,
                kill_tx,
                exit_rx,
                settled_rx,
            },
        );
        drop(processes);

        self.events.emit(OrchestratorEvent::Started {
            agent_id: ctx.agent_id.clone(),
            process_id: process_id.clone(),
            pid,
        });
        if let Some((from, to)) = started {
            self.recorder.record_transition(&ctx.agent_id, from, to).await;
        }
        self.recorder.record_snapshot(&ctx.info().await).await;

        tasks::spawn_stdin_writer(process_id.clone(), stdin, stdin_rx);
        let readers = [
            tasks::spawn_stdout_consumer(Arc::clone(&ctx), stdout),
            tasks::spawn_stderr_consumer(Arc::clone(&ctx), stderr),
        ];
        tasks::spawn_exit_watcher(
            Arc::clone(&ctx),
            child,
            readers,
            ExitSignals {
                kill_rx,
                exit_tx,
                settled_tx,
                terminate_timeout: Duration::from_secs(self.config.terminate_timeout_secs),
            },
        );

        info!(process_id = %process_id, agent_id = %ctx.agent_id, pid = ?pid, "Agent process started");
        Ok(ProcessHandle::new(
            process_id,
            ctx.agent_id.clone(),
            pid,
            ctx.output.clone(),
        ))
    }

    /// Ask a running process to terminate. Not a state transition: the exit
    /// watcher settles the status once the process is gone.
    pub async fn kill(&self, process_id: &str) -> bool {
        let (ctx, kill_tx) = {
            let processes = self.processes.read().await;
            let Some(entry) = processes.get(process_id) else {
                debug!(process_id, "Kill requested for unknown process");
                return false;
            };
            if entry.exit_rx.borrow().is_some() {
                debug!(process_id, "Kill requested for exited process");
                return false;
            }
            (Arc::clone(&entry.ctx), entry.kill_tx.clone())
        };

        if ctx.kill_requested.swap(true, Ordering::SeqCst) {
            return true;
        }
        ctx.deliver(OutputRecord::system("Process terminated by user"))
            .await;
        match kill_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {
                info!(process_id, "Termination requested");
                true
            }
            Err(TrySendError::Closed(())) => false,
        }
    }

    /// Queue a line on the process's stdin. Never waits for the write.
    pub async fn send_input(&self, process_id: &str, text: &str) -> bool {
        let processes = self.processes.read().await;
        let Some(entry) = processes.get(process_id) else {
            warn!(process_id, "send_input: unknown process");
            return false;
        };
        match entry.stdin_tx.try_send(text.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(process_id, "send_input: stdin queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(process_id, "send_input: stdin closed");
                false
            }
        }
    }

    pub async fn get_process(&self, process_id: &str) -> Option<ProcessInfo> {
        let ctx = self.context(process_id).await?;
        Some(ctx.info().await)
    }

    /// Snapshots of every tracked process, oldest first.
    pub async fn get_all_processes(&self) -> Vec<ProcessInfo> {
        self.snapshots(|_| true).await
    }

    pub async fn get_processes_by_agent(&self, agent_id: &str) -> Vec<ProcessInfo> {
        self.snapshots(|ctx| ctx.agent_id == agent_id).await
    }

    async fn snapshots<F>(&self, filter: F) -> Vec<ProcessInfo>
    where
        F: Fn(&ProcessContext) -> bool,
    {
        let contexts: Vec<Arc<ProcessContext>> = self
            .processes
            .read()
            .await
            .values()
            .filter(|e| filter(e.ctx.as_ref()))
            .map(|e| Arc::clone(&e.ctx))
            .collect();
        let mut infos = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            infos.push(ctx.info().await);
        }
        infos.sort_by_key(|i| i.started_at_ms);
        infos
    }

    /// A new subscriber to the process output, starting at the oldest
    /// retained record.
    pub async fn subscribe(
        &self,
        process_id: &str,
    ) -> Result<ReplaySubscriber<OutputRecord>, SpawnerError> {
        self.context(process_id)
            .await
            .map(|ctx| ctx.output.subscribe())
            .ok_or_else(|| SpawnerError::ProcessNotFound {
                id: process_id.to_string(),
            })
    }

    /// Wait for the OS process to exit. `None` for unknown ids; a process
    /// killed by a signal reports `-1`.
    pub async fn wait_for_process(&self, process_id: &str) -> Option<i32> {
        let mut rx = self.processes.read().await.get(process_id)?.exit_rx.clone();
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map(|code| *code)
            .unwrap_or_else(|_| *rx.borrow());
        Some(code.unwrap_or(-1))
    }

    /// Wait until the exit watcher has delivered the final record and closed
    /// the output channel. `false` for unknown ids.
    pub async fn wait_until_settled(&self, process_id: &str) -> bool {
        let Some(mut rx) = self
            .processes
            .read()
            .await
            .get(process_id)
            .map(|e| e.settled_rx.clone())
        else {
            return false;
        };
        let settled = rx.wait_for(|settled| *settled).await.is_ok();
        settled || *rx.borrow()
    }

    /// Stop tracking a finished process. A process that is still running
    /// stays tracked and `false` is returned.
    pub async fn remove_process(&self, process_id: &str) -> bool {
        let mut processes = self.processes.write().await;
        let Some(entry) = processes.get(process_id) else {
            return false;
        };
        if !entry.ctx.is_finished().await {
            debug!(process_id, "Refusing to remove unfinished process");
            return false;
        }
        processes.remove(process_id);
        drop(processes);
        self.interventions.forget_process(process_id).await;
        debug!(process_id, "Removed process");
        true
    }

    pub async fn get_session_id(&self, process_id: &str) -> Option<String> {
        let ctx = self.context(process_id).await?;
        ctx.meta.read().await.session_id.clone()
    }

    pub async fn get_total_cost(&self, process_id: &str) -> Option<f64> {
        let ctx = self.context(process_id).await?;
        Some(ctx.meta.read().await.total_cost_usd)
    }

    /// Remove every finished process: final status set and the final record
    /// delivered.
    pub async fn clear_completed(&self) -> usize {
        let mut processes = self.processes.write().await;
        let mut finished = Vec::new();
        for (id, entry) in processes.iter() {
            if entry.ctx.is_finished().await {
                finished.push(id.clone());
            }
        }
        for id in &finished {
            processes.remove(id);
        }
        drop(processes);

        for id in &finished {
            self.interventions.forget_process(id).await;
        }
        if !finished.is_empty() {
            info!(count = finished.len(), "Cleared finished processes");
        }
        finished.len()
    }

    /// Answer a pending intervention over the owning process's stdin.
    pub async fn answer_intervention(&self, request_id: &str, response: &str) -> bool {
        let Some(request) = self.interventions.get(request_id).await else {
            warn!(request_id, "Unknown intervention");
            return false;
        };
        if !request.is_pending() {
            warn!(request_id, status = %request.status, "Intervention is not pending");
            return false;
        }
        let Some(stdin_tx) = self
            .processes
            .read()
            .await
            .get(&request.process_id)
            .map(|e| e.stdin_tx.clone())
        else {
            warn!(request_id, process_id = %request.process_id, "Intervention process is gone");
            return false;
        };
        let deliver = || match stdin_tx.try_send(response.to_string()) {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id, error = %e, "Failed to deliver intervention answer");
                false
            }
        };
        if self
            .interventions
            .answer_with(request_id, response, deliver)
            .await
            .is_none()
        {
            return false;
        }

        if self
            .interventions
            .pending_count_for_process(&request.process_id)
            .await
            == 0
        {
            if let Some(ctx) = self.context(&request.process_id).await {
                let resumed = {
                    let mut meta = ctx.meta.write().await;
                    meta.status == AgentStatus::Waiting
                        && match AGENT.apply(&mut *meta, AgentStatus::Working) {
                            Ok(_) => true,
                            Err(e) => {
                                warn!(request_id, error = %e, "Agent not resumed");
                                false
                            }
                        }
                };
                if resumed {
                    self.recorder
                        .record_transition(&ctx.agent_id, AgentStatus::Waiting, AgentStatus::Working)
                        .await;
                }
            }
        }
        true
    }

    /// Time out interventions pending longer than `max_age`.
    pub async fn expire_interventions(&self, max_age: Duration) -> Vec<String> {
        self.interventions.expire_older_than(max_age).await
    }

    pub async fn pending_interventions(&self, agent_id: &str) -> Vec<InterventionRequest> {
        self.interventions.pending_for_agent(agent_id).await
    }

    async fn context(&self, process_id: &str) -> Option<Arc<ProcessContext>> {
        self.processes
            .read()
            .await
            .get(process_id)
            .map(|e| Arc::clone(&e.ctx))
    }
}

/// Errors from spawner operations.
#[derive(Debug, thiserror::Error)]
pub enum SpawnerError {
    #[error("Failed to spawn subprocess: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent {agent_id} already has an unfinished process")]
    AgentBusy { agent_id: String },

    #[error("Process not found: {id}")]
    ProcessNotFound { id: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn spawner_with_bin(bin: &str) -> AgentSpawner {
        AgentSpawner::new(
            SpawnerConfig {
                agent_bin: bin.to_string(),
                ..SpawnerConfig::default()
            },
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let spawner = spawner_with_bin("/nonexistent/drover-agent-binary");
        let err = spawner
            .spawn(SpawnOptions::new("a1", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnerError::SpawnFailed { .. }));
        assert!(spawner.get_all_processes().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_reported_not_panicked() {
        let spawner = spawner_with_bin("claude");
        assert!(!spawner.kill("nope").await);
        assert!(!spawner.send_input("nope", "x").await);
        assert!(!spawner.remove_process("nope").await);
        assert!(spawner.get_process("nope").await.is_none());
        assert!(spawner.wait_for_process("nope").await.is_none());
        assert!(!spawner.wait_until_settled("nope").await);
        assert!(spawner.get_session_id("nope").await.is_none());
        assert!(spawner.get_total_cost("nope").await.is_none());
        assert!(matches!(
            spawner.subscribe("nope").await,
            Err(SpawnerError::ProcessNotFound { .. })
        ));
        assert!(!spawner.answer_intervention("nope", "yes").await);
        assert_eq!(spawner.clear_completed().await, 0);
    }
}
