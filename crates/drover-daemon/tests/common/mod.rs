//! Shared fixtures: agents are `/bin/sh -c <prompt>` scripts that print
//! stream-json lines.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use drover_core::OutputRecord;
use drover_core::config::SpawnerConfig;
use drover_daemon::collab::ArgumentBuilder;
use drover_daemon::{AgentSpawner, EventBus, OrchestratorEvent, SpawnOptions};

/// Runs the prompt as a shell script and remembers every prompt it saw.
#[derive(Debug, Default)]
pub struct ShellArgs {
    prompts: Mutex<Vec<String>>,
}

impl ShellArgs {
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl ArgumentBuilder for ShellArgs {
    fn build_args(&self, options: &SpawnOptions) -> Vec<String> {
        self.prompts.lock().unwrap().push(options.prompt.clone());
        vec!["-c".to_string(), options.prompt.clone()]
    }
}

pub fn shell_spawner() -> (AgentSpawner, Arc<ShellArgs>) {
    shell_spawner_with(SpawnerConfig::default())
}

pub fn shell_spawner_with(config: SpawnerConfig) -> (AgentSpawner, Arc<ShellArgs>) {
    let args = Arc::new(ShellArgs::default());
    let spawner = AgentSpawner::new(
        SpawnerConfig {
            agent_bin: "/bin/sh".to_string(),
            ..config
        },
        EventBus::default(),
    )
    .with_argument_builder(args.clone());
    (spawner, args)
}

/// Script line printing one JSON message.
pub fn emit(json: &str) -> String {
    format!("printf '%s\\n' '{json}'")
}

pub fn script(lines: &[&str]) -> String {
    lines.join("\n")
}

/// A process that stays alive until killed.
pub const BLOCK: &str = "exec sleep 30";

pub fn texts(records: &[OutputRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.text_content().map(String::from))
        .collect()
}

/// Receive events until one matches, failing after a few seconds.
pub async fn next_matching<F>(
    rx: &mut broadcast::Receiver<OrchestratorEvent>,
    mut pred: F,
) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap()
}

/// Poll an async condition until it holds, failing after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}
