#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the process pool: admission, queueing, promotion.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{BLOCK, eventually, next_matching, shell_spawner, texts};
use drover_core::QueueStrategy;
use drover_daemon::collab::DirectoryProvisioner;
use drover_daemon::{
    Admission, OrchestratorEvent, PoolError, ProcessPool, SpawnOptions, SpawnRequest,
    SpawnerError,
};

fn request(agent_id: &str, script: &str) -> SpawnRequest {
    SpawnRequest::new(SpawnOptions::new(agent_id, script))
}

fn started(admission: Admission) -> String {
    match admission {
        Admission::Started(handle) => handle.process_id,
        Admission::Queued { .. } => panic!("expected a direct start"),
    }
}

fn queued(admission: Admission) -> (String, usize) {
    match admission {
        Admission::Queued { queue_id, position } => (queue_id, position),
        Admission::Started(_) => panic!("expected the request to queue"),
    }
}

async fn drained(pool: &ProcessPool) {
    let pool = pool.clone();
    eventually(move || {
        let pool = pool.clone();
        async move { pool.running_count().await == 0 && pool.queued_count().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn requests_beyond_capacity_queue_and_promote() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(2).build();
    let mut events = pool.spawner().events().subscribe();

    let first = started(pool.submit(request("a1", BLOCK)).await.unwrap());
    let second = started(pool.submit(request("a2", BLOCK)).await.unwrap());
    let (_, position) = queued(pool.submit(request("a3", BLOCK)).await.unwrap());
    assert_eq!(position, 1);
    assert_eq!(pool.running_count().await, 2);
    assert_eq!(pool.queued_count().await, 1);
    assert_eq!(pool.queued().await[0].agent_id, "a3");

    let change = next_matching(&mut events, |e| {
        matches!(e, OrchestratorEvent::QueueChanged { .. })
    })
    .await;
    assert!(matches!(
        change,
        OrchestratorEvent::QueueChanged {
            queued: 1,
            running: 2
        }
    ));

    assert!(pool.spawner().kill(&first).await);
    let promoted = next_matching(&mut events, |e| {
        matches!(e, OrchestratorEvent::Started { agent_id, .. } if agent_id == "a3")
    })
    .await;
    let OrchestratorEvent::Started { process_id, .. } = promoted else {
        panic!("expected start");
    };

    let check = pool.clone();
    eventually(move || {
        let pool = check.clone();
        async move { pool.running_count().await == 2 && pool.queued_count().await == 0 }
    })
    .await;
    let running = pool.running().await;
    assert!(running.contains(&second));
    assert!(running.contains(&process_id));

    pool.spawner().kill(&second).await;
    pool.spawner().kill(&process_id).await;
    drained(&pool).await;
}

#[tokio::test]
async fn priority_queue_promotes_highest_first() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner)
        .max_concurrent(1)
        .strategy(QueueStrategy::Priority)
        .build();
    let mut events = pool.spawner().events().subscribe();

    let blocker = started(pool.submit(request("blocker", BLOCK)).await.unwrap());
    let (_, p1) = queued(
        pool.submit(request("p1", "true").with_priority(1))
            .await
            .unwrap(),
    );
    let (_, p5) = queued(
        pool.submit(request("p5", "true").with_priority(5))
            .await
            .unwrap(),
    );
    let (_, p3) = queued(
        pool.submit(request("p3", "true").with_priority(3))
            .await
            .unwrap(),
    );
    assert_eq!((p1, p5, p3), (1, 1, 2));
    let order: Vec<i32> = pool.queued().await.iter().map(|q| q.priority).collect();
    assert_eq!(order, vec![5, 3, 1]);

    pool.spawner().kill(&blocker).await;

    let mut promoted = Vec::new();
    while promoted.len() < 3 {
        let event = next_matching(&mut events, |e| {
            matches!(e, OrchestratorEvent::Started { agent_id, .. } if agent_id != "blocker")
        })
        .await;
        promoted.push(event.agent_id().unwrap().to_string());
    }
    assert_eq!(promoted, vec!["p5", "p3", "p1"]);
    drained(&pool).await;
}

#[tokio::test]
async fn fifo_queue_ignores_priority() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(1).build();
    let mut events = pool.spawner().events().subscribe();

    let blocker = started(pool.submit(request("blocker", BLOCK)).await.unwrap());
    for (agent, priority) in [("f1", 1), ("f5", 5), ("f3", 3)] {
        pool.submit(request(agent, "true").with_priority(priority))
            .await
            .unwrap();
    }
    pool.spawner().kill(&blocker).await;

    let mut promoted = Vec::new();
    while promoted.len() < 3 {
        let event = next_matching(&mut events, |e| {
            matches!(e, OrchestratorEvent::Started { agent_id, .. } if agent_id != "blocker")
        })
        .await;
        promoted.push(event.agent_id().unwrap().to_string());
    }
    assert_eq!(promoted, vec!["f1", "f5", "f3"]);
    drained(&pool).await;
}

#[tokio::test]
async fn cancelled_request_never_runs() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(1).build();

    let blocker = started(pool.submit(request("blocker", BLOCK)).await.unwrap());
    let (queue_id, _) = queued(pool.submit(request("late", "true")).await.unwrap());

    assert!(pool.cancel(&queue_id).await);
    assert!(!pool.cancel(&queue_id).await);
    assert_eq!(pool.queued_count().await, 0);

    pool.spawner().kill(&blocker).await;
    drained(&pool).await;
    assert!(pool.spawner().get_processes_by_agent("late").await.is_empty());
}

#[tokio::test]
async fn busy_agent_waits_for_its_own_process() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(2).build();
    let mut events = pool.spawner().events().subscribe();

    let first = started(pool.submit(request("a1", BLOCK)).await.unwrap());
    let other = started(pool.submit(request("a2", BLOCK)).await.unwrap());
    queued(pool.submit(request("a1", "true")).await.unwrap());

    // A free slot alone does not admit a second run for a1.
    pool.spawner().kill(&other).await;
    let check = pool.clone();
    eventually(move || {
        let pool = check.clone();
        async move { pool.running_count().await == 1 }
    })
    .await;
    assert_eq!(pool.queued_count().await, 1);
    assert_eq!(pool.spawner().get_processes_by_agent("a1").await.len(), 1);

    pool.spawner().kill(&first).await;
    let mut seen = Vec::new();
    let promoted = next_matching(&mut events, |e| {
        seen.push(e.clone());
        matches!(e, OrchestratorEvent::Started { agent_id, process_id, .. }
            if agent_id == "a1" && *process_id != first)
    })
    .await;
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Error { process_id: None, .. }))
    );
    let OrchestratorEvent::Started { process_id, .. } = promoted else {
        panic!("expected start");
    };
    assert_eq!(pool.spawner().wait_for_process(&process_id).await, Some(0));
    drained(&pool).await;
    assert_eq!(pool.spawner().get_processes_by_agent("a1").await.len(), 2);
}

#[tokio::test]
async fn cancel_all_empties_the_queue_in_order() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(1).build();

    let blocker = started(pool.submit(request("blocker", BLOCK)).await.unwrap());
    queued(pool.submit(request("q1", "true")).await.unwrap());
    queued(pool.submit(request("q2", "true")).await.unwrap());

    let cancelled: Vec<String> = pool
        .cancel_all()
        .await
        .into_iter()
        .map(|q| q.agent_id)
        .collect();
    assert_eq!(cancelled, vec!["q1", "q2"]);
    assert!(pool.cancel_all().await.is_empty());
    assert_eq!(pool.running_count().await, 1);

    pool.spawner().kill(&blocker).await;
    drained(&pool).await;
    assert!(pool.spawner().get_processes_by_agent("q1").await.is_empty());
    assert!(pool.spawner().get_processes_by_agent("q2").await.is_empty());
}

#[tokio::test]
async fn active_agents_cover_queued_and_running_work() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(1).build();

    let blocker = started(pool.submit(request("blocker", BLOCK)).await.unwrap());
    queued(pool.submit(request("waiting", "true")).await.unwrap());

    let active = pool.active_agents().await;
    assert_eq!(active.len(), 2);
    assert!(active.contains("blocker"));
    assert!(active.contains("waiting"));

    pool.spawner().kill(&blocker).await;
    drained(&pool).await;
    let check = pool.clone();
    eventually(move || {
        let pool = check.clone();
        async move { pool.active_agents().await.is_empty() }
    })
    .await;
}

#[tokio::test]
async fn failed_promotion_moves_on_to_next_request() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(1).build();
    let mut events = pool.spawner().events().subscribe();

    let blocker = started(pool.submit(request("blocker", BLOCK)).await.unwrap());
    let bad = SpawnRequest::new(SpawnOptions::new("bad", "true").with_cwd("/nonexistent/drover"));
    queued(pool.submit(bad).await.unwrap());
    queued(pool.submit(request("good", "true")).await.unwrap());

    pool.spawner().kill(&blocker).await;

    let failure = next_matching(&mut events, |e| {
        matches!(e, OrchestratorEvent::Error { agent_id, .. } if agent_id == "bad")
    })
    .await;
    assert!(matches!(
        failure,
        OrchestratorEvent::Error {
            process_id: None,
            ..
        }
    ));
    next_matching(&mut events, |e| {
        matches!(e, OrchestratorEvent::Started { agent_id, .. } if agent_id == "good")
    })
    .await;
    drained(&pool).await;
}

#[tokio::test]
async fn failed_direct_start_does_not_hold_a_slot() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(1).build();

    let bad = SpawnRequest::new(SpawnOptions::new("bad", "true").with_cwd("/nonexistent/drover"));
    let err = pool.submit(bad).await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Spawn(SpawnerError::SpawnFailed { .. })
    ));
    assert_eq!(pool.running_count().await, 0);

    let id = started(pool.submit(request("good", "true")).await.unwrap());
    assert_eq!(pool.spawner().wait_for_process(&id).await, Some(0));
    drained(&pool).await;
}

#[tokio::test]
async fn running_count_never_exceeds_limit() {
    let (spawner, _) = shell_spawner();
    let pool = ProcessPool::builder(spawner).max_concurrent(3).build();
    let mut events = pool.spawner().events().subscribe();

    for i in 0..8 {
        pool.submit(request(&format!("a{i}"), "sleep 0.1"))
            .await
            .unwrap();
        assert!(pool.running_count().await <= 3);
    }

    let mut finished = 0;
    while finished < 8 {
        let event = next_matching(&mut events, |e| {
            e.is_terminal() || matches!(e, OrchestratorEvent::QueueChanged { .. })
        })
        .await;
        match event {
            OrchestratorEvent::QueueChanged { running, .. } => assert!(running <= 3),
            _ => finished += 1,
        }
    }
    drained(&pool).await;
    assert_eq!(pool.spawner().get_all_processes().await.len(), 8);
}

#[tokio::test]
async fn workspace_and_stage_context_are_applied() {
    let root = tempfile::tempdir().unwrap();
    let (spawner, args) = shell_spawner();
    let stages = HashMap::from([("review".to_string(), "# review notes".to_string())]);
    let pool = ProcessPool::builder(spawner)
        .provisioner(Arc::new(DirectoryProvisioner::new(root.path())))
        .context_source(Arc::new(stages))
        .build();

    let script = r#"printf '{"type":"assistant","message":{"content":[{"type":"text","text":"%s"}]}}\n' "$(pwd -P)""#;
    let id = started(
        pool.submit(request("agent-1", script).with_stage("review"))
            .await
            .unwrap(),
    );
    pool.spawner().wait_until_settled(&id).await;

    assert_eq!(args.prompts(), vec![format!("# review notes\n\n{script}")]);
    let records = pool.spawner().subscribe(&id).await.unwrap().collect().await;
    let workspace = root.path().join("agent-1").canonicalize().unwrap();
    assert_eq!(
        texts(&records)[0],
        workspace.to_string_lossy().into_owned()
    );

    let id = started(
        pool.submit(request("agent-2", "true").with_stage("deploy"))
            .await
            .unwrap(),
    );
    pool.spawner().wait_until_settled(&id).await;
    assert_eq!(args.prompts()[1], "true");
    drained(&pool).await;
}
