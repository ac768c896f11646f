//! `drover`
//!
//! Runs each prompt as its own agent through the process pool and streams
//! every orchestrator event to stdout as one JSON line.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use drover_core::QueueStrategy;
use drover_core::config::{Config, load_config};
use drover_core::tracing_init::{default_filter, init_tracing};
use drover_daemon::collab::DirectoryProvisioner;
use drover_daemon::{
    Admission, AgentSpawner, EventBus, OrchestratorEvent, ProcessPool, SpawnOptions, SpawnRequest,
};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version, about = "Drover - run a bounded pool of AI agents")]
struct Args {
    /// One agent is started per prompt
    #[arg(required = true)]
    prompts: Vec<String>,

    /// Project directory used to find `.drover/settings.json`
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Working directory for every agent
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Create one workspace per agent under this directory instead of
    /// sharing `--cwd`
    #[arg(long, conflicts_with = "cwd")]
    workspace_root: Option<PathBuf>,

    /// Maximum concurrently running agents (1-20)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Queue strategy: fifo or priority
    #[arg(long)]
    strategy: Option<QueueStrategy>,

    /// Agent executable
    #[arg(long)]
    agent_bin: Option<String>,

    /// Model passed to every agent
    #[arg(long)]
    model: Option<String>,

    /// Turn limit passed to every agent
    #[arg(long)]
    max_turns: Option<u32>,

    /// JSON file mapping stage names to handed-off context
    #[arg(long, requires = "stage")]
    context_file: Option<PathBuf>,

    /// Stage whose context is prepended to every prompt
    #[arg(long)]
    stage: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "DROVER_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(n) = self.max_concurrent {
            config.pool.max_concurrent = n;
        }
        if let Some(strategy) = self.strategy {
            config.pool.queue_strategy = strategy;
        }
        if let Some(bin) = &self.agent_bin {
            config.spawner.agent_bin.clone_from(bin);
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.log_json {
            config.log.json = true;
        }
    }

    fn request(&self, index: usize, prompt: &str) -> SpawnRequest {
        let mut options = SpawnOptions::new(format!("agent-{}", index + 1), prompt);
        options.cwd.clone_from(&self.cwd);
        options.model.clone_from(&self.model);
        options.max_turns = self.max_turns;
        let request = SpawnRequest::new(options);
        match &self.stage {
            Some(stage) => request.with_stage(stage.clone()),
            None => request,
        }
    }
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = load_config(Some(&project_dir))?;
    args.apply_overrides(&mut config);
    config.validate()?;

    let level = &config.log.level;
    let log_filter = format!("drover={level},{}", default_filter("drover_daemon", level));
    init_tracing(&log_filter, config.log.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agents = args.prompts.len(),
        max_concurrent = config.pool.max_concurrent,
        strategy = %config.pool.queue_strategy,
        agent_bin = %config.spawner.agent_bin,
        "Starting drover"
    );

    let events = EventBus::default();
    let mut event_rx = events.subscribe();
    let spawner = AgentSpawner::new(config.spawner.clone(), events);

    let mut builder = ProcessPool::builder(spawner)
        .max_concurrent(config.pool.max_concurrent)
        .strategy(config.pool.queue_strategy);
    if let Some(root) = &args.workspace_root {
        builder = builder.provisioner(Arc::new(DirectoryProvisioner::new(root)));
    }
    if let Some(path) = &args.context_file {
        let content = std::fs::read_to_string(path)?;
        let stages: HashMap<String, String> = serde_json::from_str(&content)?;
        info!(path = %path.display(), stages = stages.len(), "Loaded stage context");
        builder = builder.context_source(Arc::new(stages));
    }
    let pool = builder.build();

    let mut out = io::stdout();
    let mut outstanding: HashSet<String> = HashSet::new();
    let mut failed = false;

    for (index, prompt) in args.prompts.iter().enumerate() {
        let request = args.request(index, prompt);
        let agent_id = request.options.agent_id.clone();
        match pool.submit(request).await {
            Ok(Admission::Started(handle)) => {
                info!(agent_id = %agent_id, process_id = %handle.process_id, "Agent started");
                outstanding.insert(agent_id);
            }
            Ok(Admission::Queued { queue_id, position }) => {
                info!(agent_id = %agent_id, queue_id = %queue_id, position, "Agent queued");
                outstanding.insert(agent_id);
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Failed to start agent");
                failed = true;
                let event = OrchestratorEvent::Error {
                    agent_id,
                    process_id: None,
                    error: e.to_string(),
                };
                writeln!(out, "{}", serde_json::to_string(&event)?)?;
            }
        }
    }

    let timeout = Duration::from_secs(config.interventions.timeout_secs.max(1));
    let expiry_spawner = pool.spawner().clone();
    let expiry = tokio::spawn(async move {
        let mut ticker = tokio::time::interval((timeout / 4).max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let expired = expiry_spawner.expire_interventions(timeout).await;
            if !expired.is_empty() {
                warn!(count = expired.len(), "Interventions timed out");
            }
        }
    });

    while !outstanding.is_empty() {
        tokio::select! {
            event = event_rx.recv() => match event {
                Ok(event) => {
                    writeln!(out, "{}", serde_json::to_string(&event)?)?;
                    if event.is_terminal() {
                        if let Some(agent_id) = event.agent_id() {
                            outstanding.remove(agent_id);
                        }
                        failed |= matches!(event, OrchestratorEvent::Error { .. });
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Terminal events may have been skipped.
                    let active = pool.active_agents().await;
                    outstanding.retain(|agent_id| active.contains(agent_id));
                    warn!(skipped, outstanding = outstanding.len(), "Event output lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, terminating agents");
                for cancelled in pool.cancel_all().await {
                    outstanding.remove(&cancelled.agent_id);
                    failed = true;
                }
                for process in pool.spawner().get_all_processes().await {
                    pool.spawner().kill(&process.process_id).await;
                }
            }
        }
    }
    out.flush()?;
    expiry.abort();

    let finished = pool.spawner().get_all_processes().await;
    failed |= finished
        .iter()
        .any(|p| p.exit_code.is_some_and(|code| code != 0));
    info!(agents = finished.len(), failed, "Drover finished");

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
