//! Admission-controlled pool of agent processes.
//!
//! The [`ProcessPool`] runs at most `max_concurrent` processes at a time.
//! Requests beyond that wait in a queue ordered by the configured
//! [`QueueStrategy`] and are promoted as running processes finish. Admission
//! and promotion are serialised by one mutex over the running set and queue.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use drover_core::QueueStrategy;
use drover_core::config::{MAX_CONCURRENT, MIN_CONCURRENT, PoolConfig};
use drover_core::output::now_millis;

use crate::collab::{ContextSource, WorkspaceProvisioner};
use crate::events::OrchestratorEvent;
use crate::spawner::{AgentSpawner, ProcessHandle, SpawnOptions, SpawnerError};

/// Default maximum number of concurrently running agents.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// A request to run one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub options: SpawnOptions,
    /// Higher runs first under [`QueueStrategy::Priority`].
    pub priority: i32,
    /// Workflow stage whose handed-off context is prepended to the prompt.
    pub context_stage: Option<String>,
}

impl SpawnRequest {
    pub const fn new(options: SpawnOptions) -> Self {
        Self {
            options,
            priority: 0,
            context_stage: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.context_stage = Some(stage.into());
        self
    }
}

/// Outcome of [`ProcessPool::submit`].
#[derive(Debug)]
pub enum Admission {
    Started(ProcessHandle),
    /// `position` is 1-based in admission order at the time of queueing.
    Queued { queue_id: String, position: usize },
}

/// Snapshot of a queued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedRequest {
    pub queue_id: String,
    pub agent_id: String,
    pub priority: i32,
    pub seq: u64,
    pub enqueued_at_ms: u64,
}

struct Pending {
    queue_id: String,
    request: SpawnRequest,
    seq: u64,
    enqueued_at_ms: u64,
}

impl Pending {
    fn snapshot(&self) -> QueuedRequest {
        QueuedRequest {
            queue_id: self.queue_id.clone(),
            agent_id: self.request.options.agent_id.clone(),
            priority: self.request.priority,
            seq: self.seq,
            enqueued_at_ms: self.enqueued_at_ms,
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Running process id -> agent id.
    running: HashMap<String, String>,
    queue: Vec<Pending>,
    next_seq: u64,
}

/// Sort key: smaller is admitted first.
fn admission_key(strategy: QueueStrategy, pending: &Pending) -> (Reverse<i32>, u64) {
    match strategy {
        QueueStrategy::Fifo => (Reverse(0), pending.seq),
        QueueStrategy::Priority => (Reverse(pending.request.priority), pending.seq),
    }
}

impl PoolState {
    /// Next request to admit. Requests whose agent is still running stay
    /// queued, in order, until that agent is free.
    fn next_index(&self, strategy: QueueStrategy) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, p)| !self.agent_running(&p.request.options.agent_id))
            .min_by_key(|(_, p)| admission_key(strategy, p))
            .map(|(idx, _)| idx)
    }

    fn agent_running(&self, agent_id: &str) -> bool {
        self.running.values().any(|running| running == agent_id)
    }

    fn ordered(&self, strategy: QueueStrategy) -> Vec<&Pending> {
        let mut ordered: Vec<&Pending> = self.queue.iter().collect();
        ordered.sort_by_key(|p| admission_key(strategy, p));
        ordered
    }

    fn position_of(&self, strategy: QueueStrategy, queue_id: &str) -> Option<usize> {
        self.ordered(strategy)
            .iter()
            .position(|p| p.queue_id == queue_id)
            .map(|idx| idx + 1)
    }
}

struct PoolInner {
    spawner: AgentSpawner,
    max_concurrent: usize,
    strategy: QueueStrategy,
    provisioner: Option<Arc<dyn WorkspaceProvisioner>>,
    context: Option<Arc<dyn ContextSource>>,
    state: Mutex<PoolState>,
}

/// Builder for [`ProcessPool`].
pub struct PoolBuilder {
    spawner: AgentSpawner,
    max_concurrent: usize,
    strategy: QueueStrategy,
    provisioner: Option<Arc<dyn WorkspaceProvisioner>>,
    context: Option<Arc<dyn ContextSource>>,
}

impl PoolBuilder {
    #[must_use]
    pub const fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    #[must_use]
    pub const fn strategy(mut self, strategy: QueueStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn provisioner(mut self, provisioner: Arc<dyn WorkspaceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    #[must_use]
    pub fn context_source(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn build(self) -> ProcessPool {
        let max_concurrent = self.max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT);
        if max_concurrent != self.max_concurrent {
            warn!(
                requested = self.max_concurrent,
                clamped = max_concurrent,
                "max_concurrent out of range, clamped"
            );
        }

        info!(max_concurrent, strategy = %self.strategy, "ProcessPool created");

        ProcessPool {
            inner: Arc::new(PoolInner {
                spawner: self.spawner,
                max_concurrent,
                strategy: self.strategy,
                provisioner: self.provisioner,
                context: self.context,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }
}

/// Bounded pool of running agents with a pending queue.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub const fn builder(spawner: AgentSpawner) -> PoolBuilder {
        PoolBuilder {
            spawner,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            strategy: QueueStrategy::Fifo,
            provisioner: None,
            context: None,
        }
    }

    pub fn new(spawner: AgentSpawner, config: &PoolConfig) -> Self {
        Self::builder(spawner)
            .max_concurrent(config.max_concurrent)
            .strategy(config.queue_strategy)
            .build()
    }

    pub fn spawner(&self) -> &AgentSpawner {
        &self.inner.spawner
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn strategy(&self) -> QueueStrategy {
        self.inner.strategy
    }

    /// Start the request now if a slot is free, otherwise queue it. A request
    /// for an agent the pool is still running is queued behind it.
    ///
    /// A failed direct start is returned as an error and does not occupy a
    /// slot.
    pub async fn submit(&self, request: SpawnRequest) -> Result<Admission, PoolError> {
        let mut state = self.inner.state.lock().await;
        if state.running.len() < self.inner.max_concurrent
            && !state.agent_running(&request.options.agent_id)
        {
            let handle = self.admit(&mut state, request).await?;
            return Ok(Admission::Started(handle));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let queue_id = uuid::Uuid::new_v4().to_string();
        let agent_id = request.options.agent_id.clone();
        let priority = request.priority;
        state.queue.push(Pending {
            queue_id: queue_id.clone(),
            request,
            seq,
            enqueued_at_ms: now_millis(),
        });
        let position = state
            .position_of(self.inner.strategy, &queue_id)
            .unwrap_or(state.queue.len());
        let (queued, running) = (state.queue.len(), state.running.len());
        drop(state);

        info!(queue_id = %queue_id, agent_id = %agent_id, priority, position, "Request queued");
        self.emit_queue_changed(queued, running);
        Ok(Admission::Queued { queue_id, position })
    }

    /// Drop a queued request. `false` if it was already admitted or never
    /// existed.
    pub async fn cancel(&self, queue_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(idx) = state.queue.iter().position(|p| p.queue_id == queue_id) else {
            return false;
        };
        let pending = state.queue.remove(idx);
        let (queued, running) = (state.queue.len(), state.running.len());
        drop(state);

        info!(queue_id, agent_id = %pending.request.options.agent_id, "Queued request cancelled");
        self.emit_queue_changed(queued, running);
        true
    }

    /// Drop every queued request, returning them in admission order.
    /// Running processes are left alone.
    pub async fn cancel_all(&self) -> Vec<QueuedRequest> {
        let mut state = self.inner.state.lock().await;
        let cancelled: Vec<QueuedRequest> = state
            .ordered(self.inner.strategy)
            .into_iter()
            .map(Pending::snapshot)
            .collect();
        state.queue.clear();
        let running = state.running.len();
        drop(state);

        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "Queued requests cancelled");
            self.emit_queue_changed(0, running);
        }
        cancelled
    }

    /// Agents with a queued request or an unfinished process.
    pub async fn active_agents(&self) -> HashSet<String> {
        // Queue first: a request promoted after this read already has a
        // tracked process by the time the spawner is read.
        let mut active: HashSet<String> = self
            .queued()
            .await
            .into_iter()
            .map(|q| q.agent_id)
            .collect();
        active.extend(
            self.inner
                .spawner
                .get_all_processes()
                .await
                .into_iter()
                .filter(|p| !p.is_finished())
                .map(|p| p.agent_id),
        );
        active
    }

    pub async fn running_count(&self) -> usize {
        self.inner.state.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Process ids of running agents.
    pub async fn running(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .await
            .running
            .keys()
            .cloned()
            .collect()
    }

    /// Queued requests in the order they would be admitted.
    pub async fn queued(&self) -> Vec<QueuedRequest> {
        let state = self.inner.state.lock().await;
        state
            .ordered(self.inner.strategy)
            .into_iter()
            .map(Pending::snapshot)
            .collect()
    }

    async fn admit(
        &self,
        state: &mut PoolState,
        request: SpawnRequest,
    ) -> Result<ProcessHandle, PoolError> {
        let options = self.prepare(request).await?;
        let handle = self.inner.spawner.spawn(options).await?;
        state
            .running
            .insert(handle.process_id.clone(), handle.agent_id.clone());
        self.spawn_monitor(handle.process_id.clone());
        Ok(handle)
    }

    async fn prepare(&self, request: SpawnRequest) -> Result<SpawnOptions, PoolError> {
        let SpawnRequest {
            mut options,
            context_stage,
            ..
        } = request;

        if options.cwd.is_none() {
            if let Some(provisioner) = &self.inner.provisioner {
                let dir = provisioner
                    .provision(&options.agent_id)
                    .await
                    .map_err(|e| PoolError::Provision {
                        agent_id: options.agent_id.clone(),
                        reason: e.to_string(),
                    })?;
                options.cwd = Some(dir);
            }
        }

        if let (Some(stage), Some(source)) = (context_stage.as_deref(), &self.inner.context) {
            match source.stage_context(stage) {
                Some(context) => {
                    debug!(agent_id = %options.agent_id, stage, "Prepending stage context");
                    options.prompt = format!("{context}\n\n{}", options.prompt);
                }
                None => debug!(agent_id = %options.agent_id, stage, "No context for stage"),
            }
        }
        Ok(options)
    }

    fn spawn_monitor(&self, process_id: String) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.inner.spawner.wait_until_settled(&process_id).await;
            pool.on_settled(&process_id).await;
        });
    }

    async fn on_settled(&self, process_id: &str) {
        let mut state = self.inner.state.lock().await;
        if state.running.remove(process_id).is_none() {
            return;
        }
        debug!(process_id, "Running process finished");
        self.emit_queue_changed(state.queue.len(), state.running.len());

        let mut promoted = 0usize;
        while state.running.len() < self.inner.max_concurrent {
            let Some(idx) = state.next_index(self.inner.strategy) else {
                break;
            };
            let pending = state.queue.remove(idx);
            let queue_id = pending.queue_id;
            let agent_id = pending.request.options.agent_id.clone();
            match self.admit(&mut state, pending.request).await {
                Ok(handle) => {
                    info!(queue_id = %queue_id, process_id = %handle.process_id, agent_id = %agent_id, "Promoted queued request");
                    promoted += 1;
                }
                Err(e) => {
                    warn!(queue_id = %queue_id, agent_id = %agent_id, error = %e, "Promotion failed, trying next");
                    self.inner.spawner.events().emit(OrchestratorEvent::Error {
                        agent_id,
                        process_id: None,
                        error: e.to_string(),
                    });
                }
            }
        }

        if promoted > 0 {
            self.emit_queue_changed(state.queue.len(), state.running.len());
        }
    }

    fn emit_queue_changed(&self, queued: usize, running: usize) {
        self.inner
            .spawner
            .events()
            .emit(OrchestratorEvent::QueueChanged { queued, running });
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] SpawnerError),

    #[error("Failed to provision workspace for {agent_id}: {reason}")]
    Provision { agent_id: String, reason: String },
}
