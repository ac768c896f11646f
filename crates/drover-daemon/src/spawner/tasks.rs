//! Per-process background tasks: stdin writer, stdout and stderr consumers,
//! and the exit watcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use drover_core::intervention::{InterventionDraft, detect_intervention};
use drover_core::ndjson::{message_stream, to_output_record};
use drover_core::output::now_millis;
use drover_core::state::{AGENT, Stateful};
use drover_core::{AgentStatus, OutputRecord};

use super::types::ProcessInfo;
use crate::collab::StatusRecorder;
use crate::events::{EventBus, OrchestratorEvent, ProcessMetrics};
use crate::interventions::InterventionRegistry;
use crate::replay::ReplayChannel;

/// Mutable per-process metadata. Written only by the process's own tasks
/// and by intervention answers.
#[derive(Debug)]
pub(super) struct ProcessMeta {
    pub status: AgentStatus,
    pub session_id: Option<String>,
    pub total_cost_usd: f64,
    pub last_activity_ms: u64,
    pub exit_code: Option<i32>,
    pub records: u64,
}

impl ProcessMeta {
    pub fn new() -> Self {
        Self {
            status: AgentStatus::Idle,
            session_id: None,
            total_cost_usd: 0.0,
            last_activity_ms: now_millis(),
            exit_code: None,
            records: 0,
        }
    }
}

impl Stateful<AgentStatus> for ProcessMeta {
    fn status(&self) -> AgentStatus {
        self.status
    }

    fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
    }
}

/// Everything the tasks of one process share.
pub(super) struct ProcessContext {
    pub process_id: String,
    pub agent_id: String,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub started_at_ms: u64,
    pub meta: RwLock<ProcessMeta>,
    pub output: ReplayChannel<OutputRecord>,
    pub events: EventBus,
    pub interventions: InterventionRegistry,
    pub recorder: Arc<dyn StatusRecorder>,
    pub kill_requested: AtomicBool,
}

impl ProcessContext {
    pub async fn info(&self) -> ProcessInfo {
        let meta = self.meta.read().await;
        ProcessInfo {
            process_id: self.process_id.clone(),
            agent_id: self.agent_id.clone(),
            pid: self.pid,
            status: meta.status,
            session_id: meta.session_id.clone(),
            cwd: self.cwd.clone(),
            started_at_ms: self.started_at_ms,
            last_activity_ms: meta.last_activity_ms,
            total_cost_usd: meta.total_cost_usd,
            exit_code: meta.exit_code,
            output_closed: self.output.is_closed(),
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.meta.read().await.status.is_finished() && self.output.is_closed()
    }

    /// Push a record to the replay channel and the event bus.
    pub async fn deliver(&self, record: OutputRecord) -> bool {
        if !self.output.push(record.clone()) {
            debug!(process_id = %self.process_id, kind = %record.kind(), "Output closed, record dropped");
            return false;
        }
        self.meta.write().await.records += 1;
        self.events.emit(OrchestratorEvent::Output {
            agent_id: self.agent_id.clone(),
            process_id: self.process_id.clone(),
            record,
        });
        true
    }

    /// Push the last record and close the channel in one step, so nothing
    /// can land after it.
    pub async fn deliver_final(&self, record: OutputRecord) {
        if !self.output.push_and_close(record.clone()) {
            warn!(process_id = %self.process_id, "Output closed before the final record");
            return;
        }
        self.meta.write().await.records += 1;
        self.events.emit(OrchestratorEvent::Output {
            agent_id: self.agent_id.clone(),
            process_id: self.process_id.clone(),
            record,
        });
    }

    async fn raise_intervention(&self, draft: InterventionDraft) {
        let request = self
            .interventions
            .raise(&self.agent_id, &self.process_id, draft)
            .await;
        let moved = AGENT.apply(&mut *self.meta.write().await, AgentStatus::Waiting);
        self.events.emit(OrchestratorEvent::Intervention {
            agent_id: self.agent_id.clone(),
            request,
        });
        match moved {
            Ok(from) => {
                self.recorder
                    .record_transition(&self.agent_id, from, AgentStatus::Waiting)
                    .await;
            }
            Err(e) => {
                debug!(process_id = %self.process_id, error = %e, "Agent status left unchanged");
            }
        }
    }
}

pub(super) fn spawn_stdin_writer(
    process_id: String,
    stdin: ChildStdin,
    mut stdin_rx: mpsc::Receiver<String>,
) {
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!(process_id = %process_id, "Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!(process_id = %process_id, "Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!(process_id = %process_id, "Failed to flush stdin: {}", e);
                break;
            }
        }
        debug!(process_id = %process_id, "stdin writer finished");
    });
}

pub(super) fn spawn_stdout_consumer(
    ctx: Arc<ProcessContext>,
    stdout: ChildStdout,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = message_stream(stdout);
        tokio::pin!(stream);

        while let Some(msg) = stream.next().await {
            let metadata = msg.metadata();
            {
                let mut meta = ctx.meta.write().await;
                meta.last_activity_ms = now_millis();
                if let Some(session_id) = metadata.session_id {
                    if meta.session_id.as_ref() != Some(&session_id) {
                        debug!(process_id = %ctx.process_id, session_id = %session_id, "Session id captured");
                        meta.session_id = Some(session_id);
                    }
                }
                if let Some(cost) = metadata.cost_usd {
                    meta.total_cost_usd += cost;
                }
            }

            ctx.deliver(to_output_record(&msg)).await;

            if let Some(draft) = detect_intervention(&msg) {
                ctx.raise_intervention(draft).await;
            }
        }
        debug!(process_id = %ctx.process_id, "stdout reader finished");
    })
}

pub(super) fn spawn_stderr_consumer(
    ctx: Arc<ProcessContext>,
    stderr: ChildStderr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            warn!(process_id = %ctx.process_id, "stderr: {}", line);
            ctx.deliver(OutputRecord::error(line)).await;
        }
        debug!(process_id = %ctx.process_id, "stderr reader finished");
    })
}

/// Channels the exit watcher reports through.
pub(super) struct ExitSignals {
    pub kill_rx: mpsc::Receiver<()>,
    pub exit_tx: watch::Sender<Option<i32>>,
    pub settled_tx: watch::Sender<bool>,
    /// How long a terminated process may take before it is killed.
    pub terminate_timeout: Duration,
}

pub(super) fn spawn_exit_watcher(
    ctx: Arc<ProcessContext>,
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    signals: ExitSignals,
) {
    let ExitSignals {
        mut kill_rx,
        exit_tx,
        settled_tx,
        terminate_timeout,
    } = signals;

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Some(()) = kill_rx.recv() => {
                terminate(&mut child, &ctx.process_id);
                match tokio::time::timeout(terminate_timeout, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(
                            process_id = %ctx.process_id,
                            timeout_secs = terminate_timeout.as_secs(),
                            "Agent ignored termination, killing"
                        );
                        if let Err(e) = child.start_kill() {
                            warn!(process_id = %ctx.process_id, error = %e, "Failed to kill agent process");
                        }
                        child.wait().await
                    }
                }
            }
        };
        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                error!(process_id = %ctx.process_id, error = %e, "Failed to wait for agent process");
                -1
            }
        };
        exit_tx.send_replace(Some(exit_code));
        info!(process_id = %ctx.process_id, agent_id = %ctx.agent_id, exit_code, "Agent process exited");

        for reader in readers {
            if let Err(e) = reader.await {
                warn!(process_id = %ctx.process_id, error = %e, "Output reader task failed");
            }
        }

        finish(&ctx, exit_code).await;
        settled_tx.send_replace(true);
    });
}

/// Set the final status, deliver the final record, close the channel.
async fn finish(ctx: &ProcessContext, exit_code: i32) {
    let target = if exit_code == 0 {
        AgentStatus::Completed
    } else {
        AgentStatus::Error
    };

    let moves = {
        let mut meta = ctx.meta.write().await;
        meta.exit_code = Some(exit_code);
        settle_status(&mut meta, target, &ctx.process_id)
    };

    let expired = ctx.interventions.expire_for_process(&ctx.process_id).await;
    if !expired.is_empty() {
        debug!(process_id = %ctx.process_id, count = expired.len(), "Timed out interventions of exited process");
    }

    let final_record = match exit_code {
        0 => OutputRecord::system("Process completed successfully"),
        -1 => OutputRecord::error("Process terminated by signal"),
        code => OutputRecord::error(format!("Process exited with code {code}")),
    };
    let error_text = final_record.text_content().map(String::from);
    ctx.deliver_final(final_record).await;

    let info = ctx.info().await;
    let records = ctx.meta.read().await.records;
    if exit_code == 0 {
        ctx.events.emit(OrchestratorEvent::Completed {
            agent_id: ctx.agent_id.clone(),
            process_id: ctx.process_id.clone(),
            exit_code,
            metrics: ProcessMetrics {
                duration_ms: now_millis().saturating_sub(ctx.started_at_ms),
                total_cost_usd: info.total_cost_usd,
                session_id: info.session_id.clone(),
                records,
            },
        });
    } else {
        ctx.events.emit(OrchestratorEvent::Error {
            agent_id: ctx.agent_id.clone(),
            process_id: Some(ctx.process_id.clone()),
            error: error_text.unwrap_or_default(),
        });
    }

    for (from, to) in moves {
        ctx.recorder.record_transition(&ctx.agent_id, from, to).await;
    }
    ctx.recorder.record_snapshot(&info).await;
}

/// Drive the agent machine to `target`, passing through `working` when the
/// process exits cleanly while blocked on a human.
fn settle_status(
    meta: &mut ProcessMeta,
    target: AgentStatus,
    process_id: &str,
) -> Vec<(AgentStatus, AgentStatus)> {
    let mut moves = Vec::new();
    if target == AgentStatus::Completed
        && matches!(meta.status, AgentStatus::Waiting | AgentStatus::Paused)
    {
        if let Ok(from) = AGENT.apply(meta, AgentStatus::Working) {
            debug!(process_id, from = %from, "Resuming before completion");
            moves.push((from, AgentStatus::Working));
        }
    }
    match AGENT.apply(meta, target) {
        Ok(from) => moves.push((from, target)),
        Err(e) => warn!(process_id, error = %e, "Final status not applied"),
    }
    moves
}

#[cfg(unix)]
fn terminate(child: &mut Child, process_id: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: pid comes from our own Child handle, which has not been reaped.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(process_id, pid, error = %err, "Failed to send SIGTERM, killing");
        if let Err(e) = child.start_kill() {
            warn!(process_id, error = %e, "Failed to kill agent process");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, process_id: &str) {
    if let Err(e) = child.start_kill() {
        warn!(process_id, error = %e, "Failed to kill agent process");
    }
}
