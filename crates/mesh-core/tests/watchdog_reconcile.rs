//! Watchdog reconciliation against real worker processes: dead-worker
//! harvest, timeout aborts, and cost-budget enforcement.

use std::time::Duration;

use mesh_core::adapter::AdapterRegistry;
use mesh_core::eventlog::EventLog;
use mesh_core::machine::{self, CreateTask};
use mesh_core::spawner::{self, SpawnRequest};
use mesh_core::watchdog;
use mesh_db::models::{Agent, EventKind, TaskState};
use mesh_db::queries::agents::register_agent;
use mesh_db::queries::spawns as spawns_db;
use mesh_db::queries::tasks as tasks_db;
use mesh_test_utils::{ScriptAdapter, TestMesh, create_temp_repo};
use tempfile::TempDir;

struct Setup {
    mesh: TestMesh,
    _repo_dir: TempDir,
    repo: String,
    registry: AdapterRegistry,
}

async fn setup(script: &str) -> Setup {
    let mesh = TestMesh::new().await;
    let (repo_dir, repo_path) = create_temp_repo();
    register_agent(&mesh.pool, &Agent::new("a1", "/tmp"))
        .await
        .unwrap();

    let mut registry = AdapterRegistry::with_builtins();
    registry.register(ScriptAdapter::new("test_script", script));

    Setup {
        mesh,
        _repo_dir: repo_dir,
        repo: repo_path.to_string_lossy().into_owned(),
        registry,
    }
}

async fn spawn_task(setup: &Setup, meta: serde_json::Value, timeout_s: i64) -> (String, String) {
    let task = machine::create_task(
        &setup.mesh.pool,
        &setup.mesh.data_dir,
        CreateTask {
            title: "watched task".to_owned(),
            meta,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    machine::assign(&setup.mesh.pool, &setup.mesh.data_dir, &task.task_id, "a1", "mesh/watched")
        .await
        .unwrap();

    let record = spawner::spawn(
        &setup.mesh.pool,
        &setup.mesh.data_dir,
        &setup.registry,
        &SpawnRequest {
            task_id: task.task_id.clone(),
            agent_id: "a1".to_owned(),
            repo_cwd: setup.repo.clone(),
            model: "sonnet".to_owned(),
            timeout_s,
            backend: "test_script".to_owned(),
        },
    )
    .await
    .unwrap();
    (task.task_id, record.spawn_id)
}

async fn wait_until_dead(setup: &Setup, spawn_id: &str) {
    for _ in 0..200 {
        let status = spawner::check(&setup.mesh.pool, spawn_id).await.unwrap();
        if !status.running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("worker {spawn_id} did not exit in time");
}

#[tokio::test]
async fn dead_worker_is_auto_harvested() {
    let setup = setup("exit 0").await; // dies without writing output
    let (task_id, spawn_id) = spawn_task(&setup, serde_json::json!({}), 0).await;
    wait_until_dead(&setup, &spawn_id).await;

    let result = watchdog::scan(&setup.mesh.pool, &setup.mesh.data_dir, &setup.registry, 3600, 0)
        .await
        .unwrap();
    assert_eq!(result.harvested_spawns, vec![spawn_id.clone()]);

    // Fail-closed parse: no output file means failure, task aborted.
    let spawn = spawns_db::get_spawn(&setup.mesh.pool, &spawn_id).await.unwrap().unwrap();
    assert_eq!(spawn.outcome, "failure");
    assert!(!spawn.ended_at.is_empty());
    let task = tasks_db::get_task(&setup.mesh.pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Aborted);

    // GC evidence for the alpha gate.
    let events = EventLog::new(&setup.mesh.data_dir).read(0).unwrap();
    let gc: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Gc).collect();
    assert_eq!(gc.len(), 1);
    assert_eq!(gc[0].payload["harvested_spawns"][0], spawn_id);
}

#[tokio::test]
async fn timed_out_worker_is_aborted() {
    let setup = setup("sleep 60").await;
    let (task_id, spawn_id) = spawn_task(&setup, serde_json::json!({}), 1).await;

    // Not yet over the 1 s timeout: nothing happens.
    let result = watchdog::scan(&setup.mesh.pool, &setup.mesh.data_dir, &setup.registry, 3600, 0)
        .await
        .unwrap();
    assert!(result.timed_out_spawns.is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let result = watchdog::scan(&setup.mesh.pool, &setup.mesh.data_dir, &setup.registry, 3600, 0)
        .await
        .unwrap();
    assert_eq!(result.timed_out_spawns, vec![spawn_id.clone()]);

    let spawn = spawns_db::get_spawn(&setup.mesh.pool, &spawn_id).await.unwrap().unwrap();
    assert_eq!(spawn.outcome, "aborted");
    let task = tasks_db::get_task(&setup.mesh.pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Aborted);
}

#[tokio::test]
async fn cost_budget_aborts_overspending_task() {
    let setup = setup("sleep 60").await;
    let (task_id, spawn_id) = spawn_task(
        &setup,
        serde_json::json!({"max_cost_usd": 1.0}),
        0,
    )
    .await;

    // Prior attempts burned the budget.
    let log = EventLog::new(&setup.mesh.data_dir);
    for cost in [0.6, 0.7] {
        log.append(
            EventKind::WorkerDone,
            "a1",
            serde_json::json!({"task_id": task_id, "outcome": "failure", "cost_usd": cost}),
        )
        .unwrap();
    }

    let result = watchdog::scan(&setup.mesh.pool, &setup.mesh.data_dir, &setup.registry, 3600, 0)
        .await
        .unwrap();
    assert_eq!(result.cost_exceeded_tasks, vec![task_id.clone()]);

    let spawn = spawns_db::get_spawn(&setup.mesh.pool, &spawn_id).await.unwrap().unwrap();
    assert_eq!(spawn.outcome, "aborted");

    let events = log.read(0).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::CostExceeded
        && e.payload["task_id"] == task_id));
}

#[tokio::test]
async fn under_budget_task_is_left_alone() {
    let setup = setup("sleep 60").await;
    let (task_id, spawn_id) = spawn_task(
        &setup,
        serde_json::json!({"max_cost_usd": 5.0}),
        0,
    )
    .await;

    EventLog::new(&setup.mesh.data_dir)
        .append(
            EventKind::WorkerDone,
            "a1",
            serde_json::json!({"task_id": task_id, "outcome": "failure", "cost_usd": 0.5}),
        )
        .unwrap();

    let result = watchdog::scan(&setup.mesh.pool, &setup.mesh.data_dir, &setup.registry, 3600, 0)
        .await
        .unwrap();
    assert!(result.cost_exceeded_tasks.is_empty());

    let spawn = spawns_db::get_spawn(&setup.mesh.pool, &spawn_id).await.unwrap().unwrap();
    assert!(spawn.ended_at.is_empty(), "live worker must not be touched");

    // Clean up the sleeping worker.
    spawner::abort(&setup.mesh.pool, &setup.mesh.data_dir, &spawn_id, "test cleanup", true)
        .await
        .unwrap();
}
