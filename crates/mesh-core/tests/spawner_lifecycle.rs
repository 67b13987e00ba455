//! Spawner lifecycle: launch, harvest, abort, and the double-finalize
//! race, exercised with real subprocesses in real git worktrees.

use std::time::Duration;

use mesh_core::adapter::AdapterRegistry;
use mesh_core::control;
use mesh_core::eventlog::EventLog;
use mesh_core::machine::{self, CreateTask};
use mesh_core::spawner::{self, SpawnError, SpawnRequest};
use mesh_db::models::{Agent, EventKind, TaskState};
use mesh_db::queries::agents::register_agent;
use mesh_db::queries::attempts as attempts_db;
use mesh_db::queries::spawns as spawns_db;
use mesh_db::queries::tasks as tasks_db;
use mesh_test_utils::{ScriptAdapter, TestMesh, create_temp_repo};
use tempfile::TempDir;

/// Script that records a successful worker run and exits.
const SUCCESS_SCRIPT: &str = r#"echo '{"success": true, "cost_usd": 0.25, "num_input_tokens": 100, "num_output_tokens": 40}' > {output}"#;

/// Script that exits without producing output (parse fails closed).
const SILENT_SCRIPT: &str = "exit 0";

/// Script that outlives the test unless aborted.
const SLEEP_SCRIPT: &str = "sleep 60";

struct Setup {
    mesh: TestMesh,
    _repo_dir: TempDir,
    repo: String,
    registry: AdapterRegistry,
    task_id: String,
}

async fn setup(script: &str) -> Setup {
    let mesh = TestMesh::new().await;
    let (repo_dir, repo_path) = create_temp_repo();

    register_agent(&mesh.pool, &Agent::new("a1", "/tmp"))
        .await
        .unwrap();
    let task = machine::create_task(
        &mesh.pool,
        &mesh.data_dir,
        CreateTask {
            title: "worker task".to_owned(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    machine::assign(&mesh.pool, &mesh.data_dir, &task.task_id, "a1", "mesh/worker")
        .await
        .unwrap();

    let mut registry = AdapterRegistry::with_builtins();
    registry.register(ScriptAdapter::new("test_script", script));

    Setup {
        mesh,
        _repo_dir: repo_dir,
        repo: repo_path.to_string_lossy().into_owned(),
        registry,
        task_id: task.task_id,
    }
}

fn request(setup: &Setup) -> SpawnRequest {
    SpawnRequest {
        task_id: setup.task_id.clone(),
        agent_id: "a1".to_owned(),
        repo_cwd: setup.repo.clone(),
        model: "sonnet".to_owned(),
        timeout_s: 0,
        backend: "test_script".to_owned(),
    }
}

/// Poll until the worker process has exited.
async fn wait_until_exited(setup: &Setup, spawn_id: &str) {
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
async fn spawn_and_harvest_success() {
    let setup = setup(SUCCESS_SCRIPT).await;
    let (pool, data_dir) = (&setup.mesh.pool, &setup.mesh.data_dir);

    let record = spawner::spawn(pool, data_dir, &setup.registry, &request(&setup))
        .await
        .unwrap();
    assert!(record.pid > 0);
    assert!(record.context_hash.starts_with("sha256:"));
    assert!(record.worktree_path.contains(".worktrees"));

    // Spawn drove the task to running.
    let task = tasks_db::get_task(pool, &setup.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Running);

    wait_until_exited(&setup, &record.spawn_id).await;

    let result = spawner::harvest(pool, data_dir, &setup.registry, &record.spawn_id, true)
        .await
        .unwrap();
    assert_eq!(result.outcome, "success");
    assert!((result.cost_usd - 0.25).abs() < f64::EPSILON);
    assert_eq!(result.tokens_in, 100);
    assert_eq!(result.tokens_out, 40);

    // Harvest drove the task onward and closed the attempt.
    let task = tasks_db::get_task(pool, &setup.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::PrOpen);
    let attempts = attempts_db::list_attempts(pool, &setup.task_id).await.unwrap();
    assert_eq!(attempts[0].outcome, "success");

    // Finalization symmetry and worktree cleanup.
    let spawn = spawns_db::get_spawn(pool, &record.spawn_id).await.unwrap().unwrap();
    assert!(!spawn.ended_at.is_empty());
    assert_eq!(spawn.outcome, "success");
    assert!(!std::path::Path::new(&record.worktree_path).exists());

    // Receipts: ADAPTER_LOAD + WORKER_SPAWN at launch, WORKER_DONE at
    // harvest, with sanitization evidence on the spawn payload.
    let events = EventLog::new(data_dir).read(0).unwrap();
    let spawn_evt = events
        .iter()
        .find(|e| e.kind == EventKind::WorkerSpawn && e.payload["spawn_id"] == record.spawn_id)
        .expect("WORKER_SPAWN event");
    assert_eq!(spawn_evt.payload["env_sanitized"], true);
    assert!(spawn_evt.payload["stripped_keys"].is_array());
    assert!(events.iter().any(|e| e.kind == EventKind::AdapterLoad));
    let done: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::WorkerDone && e.payload["spawn_id"] == record.spawn_id)
        .collect();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].payload["outcome"], "success");
}

#[tokio::test]
async fn harvest_failure_aborts_task() {
    let setup = setup(SILENT_SCRIPT).await;
    let (pool, data_dir) = (&setup.mesh.pool, &setup.mesh.data_dir);

    let record = spawner::spawn(pool, data_dir, &setup.registry, &request(&setup))
        .await
        .unwrap();
    wait_until_exited(&setup, &record.spawn_id).await;

    let result = spawner::harvest(pool, data_dir, &setup.registry, &record.spawn_id, true)
        .await
        .unwrap();
    assert_eq!(result.outcome, "failure");

    let task = tasks_db::get_task(pool, &setup.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Aborted);
    let attempts = attempts_db::list_attempts(pool, &setup.task_id).await.unwrap();
    assert_eq!(attempts[0].outcome, "failure");
}

#[tokio::test]
async fn double_harvest_has_single_winner() {
    let setup = setup(SUCCESS_SCRIPT).await;
    let (pool, data_dir) = (&setup.mesh.pool, &setup.mesh.data_dir);

    let record = spawner::spawn(pool, data_dir, &setup.registry, &request(&setup))
        .await
        .unwrap();
    wait_until_exited(&setup, &record.spawn_id).await;

    let (a, b) = tokio::join!(
        spawner::harvest(pool, data_dir, &setup.registry, &record.spawn_id, true),
        spawner::harvest(pool, data_dir, &setup.registry, &record.spawn_id, true),
    );

    let outcomes = [a, b];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one harvester wins the CAS");
    let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(
        loser.as_ref().unwrap_err(),
        SpawnError::RaceLost(_) | SpawnError::AlreadyHarvested(_)
    ));

    // The outcome was written once; exactly one WORKER_DONE was emitted.
    let spawn = spawns_db::get_spawn(pool, &record.spawn_id).await.unwrap().unwrap();
    assert_eq!(spawn.outcome, "success");
    let events = EventLog::new(data_dir).read(0).unwrap();
    let done = events
        .iter()
        .filter(|e| e.kind == EventKind::WorkerDone && e.payload["spawn_id"] == record.spawn_id)
        .count();
    assert_eq!(done, 1);
}

#[tokio::test]
async fn harvest_refuses_while_running_then_abort_wins() {
    let setup = setup(SLEEP_SCRIPT).await;
    let (pool, data_dir) = (&setup.mesh.pool, &setup.mesh.data_dir);

    let record = spawner::spawn(pool, data_dir, &setup.registry, &request(&setup))
        .await
        .unwrap();

    let err = spawner::harvest(pool, data_dir, &setup.registry, &record.spawn_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::StillRunning { .. }), "{err}");

    let aborted = spawner::abort(pool, data_dir, &record.spawn_id, "operator abort", true)
        .await
        .unwrap();
    assert_eq!(aborted.outcome, "aborted");

    let task = tasks_db::get_task(pool, &setup.task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Aborted);
    let attempts = attempts_db::list_attempts(pool, &setup.task_id).await.unwrap();
    assert_eq!(attempts[0].outcome, "aborted");

    // Second abort loses cleanly.
    let err = spawner::abort(pool, data_dir, &record.spawn_id, "again", true)
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::AlreadyEnded { .. }), "{err}");

    // The worker process is gone.
    for _ in 0..100 {
        if !spawner::pid_alive(record.pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("aborted worker still alive");
}

#[tokio::test]
async fn frozen_orchestrator_blocks_spawns() {
    let setup = setup(SUCCESS_SCRIPT).await;
    let (pool, data_dir) = (&setup.mesh.pool, &setup.mesh.data_dir);

    let owner = control::make_owner("ops");
    control::set_frozen(pool, data_dir, true, &owner, "").await.unwrap();

    let err = spawner::spawn(pool, data_dir, &setup.registry, &request(&setup))
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::Frozen), "{err}");

    control::set_frozen(pool, data_dir, false, &owner, "").await.unwrap();
    spawner::spawn(pool, data_dir, &setup.registry, &request(&setup))
        .await
        .unwrap();
}

#[tokio::test]
async fn spawn_requires_assigned_task_and_known_backend() {
    let setup = setup(SUCCESS_SCRIPT).await;
    let (pool, data_dir) = (&setup.mesh.pool, &setup.mesh.data_dir);

    let mut bad_backend = request(&setup);
    bad_backend.backend = "nope".to_owned();
    let err = spawner::spawn(pool, data_dir, &setup.registry, &bad_backend)
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::Adapter(_)), "{err}");

    let planned = machine::create_task(
        pool,
        data_dir,
        CreateTask {
            title: "not assigned".to_owned(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let mut unassigned = request(&setup);
    unassigned.task_id = planned.task_id;
    let err = spawner::spawn(pool, data_dir, &setup.registry, &unassigned)
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::TaskNotAssigned { .. }), "{err}");
}
