//! Worker spawn supervisor: launch, liveness, and exactly-once
//! finalization of worker subprocesses in isolated git worktrees.
//!
//! The finalization CAS in the store is the single source of truth for
//! who harvested or aborted a spawn; every side effect (task transition,
//! attempt close, receipt, worktree removal) happens only on the winning
//! path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::TimeZone;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use thiserror::Error;

use mesh_db::config::DataDir;
use mesh_db::models::{EventKind, Spawn, TaskState, new_id, now_ts};
use mesh_db::queries::attempts as attempts_db;
use mesh_db::queries::spawns as spawns_db;
use mesh_db::queries::tasks as tasks_db;
use mesh_db::retry::with_busy_retry;

use crate::adapter::{AdapterError, AdapterRegistry, WorkerOutput};
use crate::control;
use crate::eventlog::EventLog;
use crate::gitbridge;
use crate::machine;
use crate::policy::{self, RepoPolicy};
use crate::weave::{self, WeaveParams};

/// Environment keys always stripped from worker processes, before any
/// policy additions.
const DEFAULT_STRIP_ENV: &[&str] = &["CLAUDECODE"];

/// Spawn supervisor failures.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("orchestrator is frozen; new spawns are blocked")]
    Frozen,

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {task_id} not in assigned state (is {state})")]
    TaskNotAssigned { task_id: String, state: TaskState },

    #[error("task {0} has no branch set")]
    NoBranch(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("failed to create worktree: {0}")]
    Worktree(#[from] gitbridge::GitError),

    #[error("failed to start worker process: {0}")]
    Launch(#[source] std::io::Error),

    #[error("failed to transition task to running: {0}")]
    TransitionFailed(String),

    #[error("spawn {0} not found")]
    NotFound(String),

    #[error("spawn {0} already harvested")]
    AlreadyHarvested(String),

    #[error("spawn {spawn_id} already ended ({outcome})")]
    AlreadyEnded { spawn_id: String, outcome: String },

    #[error("spawn {spawn_id} still running (pid={pid})")]
    StillRunning { spawn_id: String, pid: i64 },

    #[error("spawn {0} already finalized (race)")]
    RaceLost(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Inputs for one worker launch.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub agent_id: String,
    pub repo_cwd: String,
    pub model: String,
    pub timeout_s: i64,
    pub backend: String,
}

/// Read-only liveness probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub spawn_id: String,
    pub running: bool,
    pub exit_code: Option<i32>,
}

/// Result of a successful harvest.
#[derive(Debug, Clone)]
pub struct HarvestResult {
    pub spawn_id: String,
    pub outcome: String,
    pub output_data: Value,
    pub cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub verification_command: String,
    pub verification_passed: Option<bool>,
    pub verification_summary: String,
}

/// Launch a worker subprocess for an assigned task.
///
/// Creates the worktree, launches the child detached with a sanitized
/// environment, drives the task `assigned -> running` (rolling both back
/// on failure), persists the spawn record, and emits the receipts.
pub async fn spawn(
    pool: &SqlitePool,
    data_dir: &DataDir,
    registry: &AdapterRegistry,
    request: &SpawnRequest,
) -> Result<Spawn, SpawnError> {
    if control::is_frozen(pool).await? {
        return Err(SpawnError::Frozen);
    }

    let task = tasks_db::get_task(pool, &request.task_id)
        .await?
        .ok_or_else(|| SpawnError::TaskNotFound(request.task_id.clone()))?;
    if task.state != TaskState::Assigned {
        return Err(SpawnError::TaskNotAssigned {
            task_id: request.task_id.clone(),
            state: task.state,
        });
    }
    if task.branch.is_empty() {
        return Err(SpawnError::NoBranch(request.task_id.clone()));
    }

    // Resolve the adapter early so an unknown backend fails fast.
    let repo_policy = RepoPolicy::load(&request.repo_cwd);
    let adapter = registry.get(&request.backend)?;
    crate::adapter::enforce_adapter_policy(
        registry,
        &request.backend,
        &request.repo_cwd,
        &repo_policy.worker_adapters,
    )?;
    let info = registry.describe(&request.backend)?;

    let spawn_id = new_id("spawn");
    let repo_root = Path::new(&request.repo_cwd)
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(&request.repo_cwd));

    let wt_dir = repo_root.join(".worktrees").join(&spawn_id);
    if let Some(parent) = wt_dir.parent() {
        std::fs::create_dir_all(parent).map_err(SpawnError::Launch)?;
    }
    gitbridge::create_worktree(&task.branch, &wt_dir, &repo_root)?;

    let mut context = format!("Task: {}\n", task.title);
    if !task.description.is_empty() {
        context.push_str(&format!("Description: {}\n", task.description));
    }
    context.push_str(&format!("Branch: {}\n", task.branch));
    let context_hash = format!("sha256:{}", crate::canon::sha256_hex(context.as_bytes()));

    let am_dir = wt_dir.join(".agentmesh");
    std::fs::create_dir_all(&am_dir).map_err(SpawnError::Launch)?;
    let spec = adapter.build_spawn_spec(&context, &request.model, &wt_dir, &am_dir);

    let (child_env, stripped_keys) = sanitized_env(&repo_policy, &spec.env);

    let child = match launch_child(&spec.command, &wt_dir, &spec.output_path, spec.stdout_to_file, &child_env)
    {
        Ok(child) => child,
        Err(err) => {
            let _ = gitbridge::remove_worktree(&wt_dir, Some(&repo_root), true);
            return Err(SpawnError::Launch(err));
        }
    };
    let pid = child.id() as i64;

    // Reap the child in the background. Without this, an exited worker
    // stays a zombie of this process and signal-0 keeps reporting it
    // alive.
    std::thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
    });

    if let Err(err) = machine::transition(
        pool,
        data_dir,
        &request.task_id,
        TaskState::Running,
        &request.agent_id,
        &format!("spawned {spawn_id}"),
        Default::default(),
    )
    .await
    {
        terminate_pid(pid);
        let _ = gitbridge::remove_worktree(&wt_dir, Some(&repo_root), true);
        return Err(SpawnError::TransitionFailed(err.to_string()));
    }

    let attempts = attempts_db::list_attempts(pool, &request.task_id).await?;
    let attempt_id = attempts
        .last()
        .map(|a| a.attempt_id.clone())
        .unwrap_or_default();

    let pid_started_at = get_pid_create_time(pid);

    let record = Spawn {
        spawn_id: spawn_id.clone(),
        task_id: request.task_id.clone(),
        attempt_id: attempt_id.clone(),
        agent_id: request.agent_id.clone(),
        pid,
        pid_started_at,
        worktree_path: wt_dir.to_string_lossy().into_owned(),
        branch: task.branch.clone(),
        episode_id: task.episode_id.clone(),
        context_hash: context_hash.clone(),
        started_at: now_ts(),
        ended_at: String::new(),
        outcome: String::new(),
        output_path: spec.output_path.to_string_lossy().into_owned(),
        repo_cwd: repo_root.to_string_lossy().into_owned(),
        timeout_s: request.timeout_s,
        backend: request.backend.clone(),
        backend_version: info.version.clone(),
    };
    with_busy_retry(|| spawns_db::insert_spawn(pool, &record)).await?;

    weave::append_weave(
        pool,
        data_dir,
        WeaveParams {
            trace_id: spawn_id.clone(),
            episode_id: Some(task.episode_id.clone()),
            ..Default::default()
        },
    )
    .await?;

    let log = EventLog::new(data_dir);
    log.append(
        EventKind::AdapterLoad,
        &request.agent_id,
        json!({
            "spawn_id": &spawn_id,
            "backend": &request.backend,
            "backend_version": &info.version,
            "module": &info.module,
            "origin": &info.origin,
        }),
    )?;
    log.append(
        EventKind::WorkerSpawn,
        &request.agent_id,
        json!({
            "spawn_id": &spawn_id,
            "task_id": &request.task_id,
            "attempt_id": &attempt_id,
            "pid": pid,
            "branch": &task.branch,
            "context_hash": &context_hash,
            "backend": &request.backend,
            "backend_version": &info.version,
            "env_sanitized": true,
            "stripped_keys": stripped_keys,
        }),
    )?;

    tracing::info!(spawn_id = %record.spawn_id, pid, task_id = %request.task_id, "worker spawned");
    Ok(record)
}

/// Poll-only liveness check. No side effects, no receipts.
pub async fn check(pool: &SqlitePool, spawn_id: &str) -> Result<CheckResult, SpawnError> {
    let record = get_record(pool, spawn_id).await?;

    if !record.ended_at.is_empty() {
        let exit_code = if record.outcome == "success" { 0 } else { 1 };
        return Ok(CheckResult {
            spawn_id: spawn_id.to_owned(),
            running: false,
            exit_code: Some(exit_code),
        });
    }

    Ok(CheckResult {
        spawn_id: spawn_id.to_owned(),
        running: pid_alive(record.pid),
        exit_code: None,
    })
}

/// Collect output from a finished worker. CAS-gated: exactly one of any
/// concurrent harvest/abort pair performs side effects; the loser gets
/// [`SpawnError::RaceLost`].
pub async fn harvest(
    pool: &SqlitePool,
    data_dir: &DataDir,
    registry: &AdapterRegistry,
    spawn_id: &str,
    cleanup_worktree: bool,
) -> Result<HarvestResult, SpawnError> {
    let record = get_record(pool, spawn_id).await?;
    if !record.ended_at.is_empty() {
        return Err(SpawnError::AlreadyHarvested(spawn_id.to_owned()));
    }

    let status = check(pool, spawn_id).await?;
    if status.running {
        return Err(SpawnError::StillRunning {
            spawn_id: spawn_id.to_owned(),
            pid: record.pid,
        });
    }

    // Read output via the recorded adapter; unknown backends fail closed
    // instead of crashing the watchdog or CLI.
    let worker_out = match registry.get(&record.backend) {
        Ok(adapter) => adapter.parse_output(Path::new(&record.output_path)),
        Err(_) => WorkerOutput::unknown_backend(&record.backend),
    };

    let mut success = worker_out.success;
    let mut outcome = if success { "success" } else { "failure" }.to_owned();
    let mut output_data = worker_out.raw.clone();

    // Claim finalization atomically BEFORE any side effects.
    let ended_at = now_ts();
    let claimed =
        with_busy_retry(|| spawns_db::finalize_spawn(pool, spawn_id, &ended_at, &outcome)).await?;
    if !claimed {
        return Err(SpawnError::RaceLost(spawn_id.to_owned()));
    }

    // -- Side effects: only the winner of the CAS reaches here --

    let task_meta = tasks_db::get_task(pool, &record.task_id)
        .await?
        .map(|t| t.meta.0)
        .unwrap_or_else(|| json!({}));
    let verify_cmd = policy::verification_command(&task_meta, &record.repo_cwd);
    let mut verify_passed: Option<bool> = None;
    let mut verify_summary = String::new();

    if success && !verify_cmd.is_empty() {
        let (passed, summary) =
            gitbridge::run_tests(&verify_cmd, Path::new(&record.worktree_path)).await;
        verify_passed = Some(passed);
        verify_summary = trim_summary(&summary, 1000);
        if !passed {
            success = false;
            outcome = "failure".to_owned();
            merge_output(
                &mut output_data,
                json!({
                    "error": "test_mismatch",
                    "verify_tests_command": &verify_cmd,
                    "verify_summary": &verify_summary,
                }),
            );
            spawns_db::update_spawn_outcome(pool, spawn_id, &outcome).await?;
            EventLog::new(data_dir).append(
                EventKind::TestMismatch,
                &record.agent_id,
                json!({
                    "spawn_id": spawn_id,
                    "task_id": &record.task_id,
                    "command": &verify_cmd,
                    "summary": &verify_summary,
                }),
            )?;
        }
    }

    let mut transition_error = String::new();
    if success {
        if let Err(err) = machine::transition(
            pool,
            data_dir,
            &record.task_id,
            TaskState::PrOpen,
            &record.agent_id,
            &format!("harvest {spawn_id}"),
            Default::default(),
        )
        .await
        {
            // Another controller may have moved the task to a terminal
            // state. Harvest stays non-throwing and this run is a failure.
            transition_error = err.to_string();
            outcome = "failure".to_owned();
            merge_output(
                &mut output_data,
                json!({"error": "task_transition_failed", "detail": &transition_error}),
            );
            spawns_db::update_spawn_outcome(pool, spawn_id, &outcome).await?;
        }
    } else if let Err(err) = machine::abort(
        pool,
        data_dir,
        &record.task_id,
        &format!("worker failed: {spawn_id}"),
        &record.agent_id,
    )
    .await
    {
        transition_error = err.to_string();
        merge_output(
            &mut output_data,
            json!({"error": "task_transition_failed", "detail": &transition_error}),
        );
    }

    if !record.attempt_id.is_empty() {
        attempts_db::end_attempt(pool, &record.attempt_id, &outcome, "").await?;
    }

    weave::append_weave(
        pool,
        data_dir,
        WeaveParams {
            trace_id: spawn_id.to_owned(),
            episode_id: Some(record.episode_id.clone()),
            ..Default::default()
        },
    )
    .await?;

    EventLog::new(data_dir).append(
        EventKind::WorkerDone,
        &record.agent_id,
        json!({
            "spawn_id": spawn_id,
            "task_id": &record.task_id,
            "outcome": &outcome,
            "cost_usd": worker_out.cost_usd,
            "tokens_in": worker_out.tokens_in,
            "tokens_out": worker_out.tokens_out,
            "transition_error": &transition_error,
            "verification_command": &verify_cmd,
            "verification_passed": verify_passed,
            "verification_summary": &verify_summary,
        }),
    )?;

    if cleanup_worktree {
        cleanup_record_worktree(&record);
    }

    Ok(HarvestResult {
        spawn_id: spawn_id.to_owned(),
        outcome,
        output_data,
        cost_usd: worker_out.cost_usd,
        tokens_in: worker_out.tokens_in,
        tokens_out: worker_out.tokens_out,
        verification_command: verify_cmd,
        verification_passed: verify_passed,
        verification_summary: verify_summary,
    })
}

/// Abort a running worker: best-effort TERM/KILL, CAS finalize with
/// `aborted`, then the winner-side effects.
pub async fn abort(
    pool: &SqlitePool,
    data_dir: &DataDir,
    spawn_id: &str,
    reason: &str,
    cleanup_worktree: bool,
) -> Result<Spawn, SpawnError> {
    let mut record = get_record(pool, spawn_id).await?;
    if !record.ended_at.is_empty() {
        let outcome = if record.outcome.is_empty() {
            "unknown".to_owned()
        } else {
            record.outcome.clone()
        };
        return Err(SpawnError::AlreadyEnded {
            spawn_id: spawn_id.to_owned(),
            outcome,
        });
    }

    // Safe even if another caller is also aborting.
    terminate_pid(record.pid);

    let ended_at = now_ts();
    let claimed =
        with_busy_retry(|| spawns_db::finalize_spawn(pool, spawn_id, &ended_at, "aborted")).await?;
    if !claimed {
        return Err(SpawnError::RaceLost(spawn_id.to_owned()));
    }

    // -- Side effects: only the winner of the CAS reaches here --

    if let Err(err) = machine::abort(
        pool,
        data_dir,
        &record.task_id,
        &if reason.is_empty() {
            format!("worker aborted: {spawn_id}")
        } else {
            reason.to_owned()
        },
        &record.agent_id,
    )
    .await
    {
        // Already terminal elsewhere; the spawn abort still stands.
        tracing::debug!(spawn_id, %err, "task abort skipped");
    }

    if !record.attempt_id.is_empty() {
        attempts_db::end_attempt(pool, &record.attempt_id, "aborted", reason).await?;
    }

    record.ended_at = ended_at;
    record.outcome = "aborted".to_owned();

    weave::append_weave(
        pool,
        data_dir,
        WeaveParams {
            trace_id: spawn_id.to_owned(),
            episode_id: Some(record.episode_id.clone()),
            ..Default::default()
        },
    )
    .await?;

    EventLog::new(data_dir).append(
        EventKind::WorkerDone,
        &record.agent_id,
        json!({
            "spawn_id": spawn_id,
            "task_id": &record.task_id,
            "outcome": "aborted",
            "reason": reason,
        }),
    )?;

    if cleanup_worktree {
        cleanup_record_worktree(&record);
    }

    Ok(record)
}

/// List spawn records, optionally only unfinalized ones.
pub async fn list_spawns(pool: &SqlitePool, active_only: bool) -> Result<Vec<Spawn>, SpawnError> {
    Ok(spawns_db::list_spawns(pool, active_only).await?)
}

async fn get_record(pool: &SqlitePool, spawn_id: &str) -> Result<Spawn, SpawnError> {
    spawns_db::get_spawn(pool, spawn_id)
        .await?
        .ok_or_else(|| SpawnError::NotFound(spawn_id.to_owned()))
}

fn merge_output(target: &mut Value, extra: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    if let (Some(obj), Some(extra_obj)) = (target.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            obj.insert(k.clone(), v.clone());
        }
    }
}

fn trim_summary(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_owned();
    }
    chars[chars.len() - max_chars..].iter().collect()
}

/// Build the child environment: parent env minus the deny list (defaults
/// plus policy `worker_runtime.strip_env`), then the adapter's env on top.
/// The parent environment itself is never mutated. Returns the sanitized
/// map and the keys actually stripped.
fn sanitized_env(
    repo_policy: &RepoPolicy,
    adapter_env: &std::collections::HashMap<String, String>,
) -> (BTreeMap<String, String>, Vec<String>) {
    let mut deny: Vec<&str> = DEFAULT_STRIP_ENV.to_vec();
    for key in &repo_policy.worker_runtime.strip_env {
        deny.push(key.as_str());
    }

    let mut env = BTreeMap::new();
    let mut stripped = Vec::new();
    for (key, value) in std::env::vars() {
        if deny.contains(&key.as_str()) {
            stripped.push(key);
        } else {
            env.insert(key, value);
        }
    }
    for (key, value) in adapter_env {
        env.insert(key.clone(), value.clone());
    }
    stripped.sort();
    (env, stripped)
}

fn launch_child(
    command: &[String],
    cwd: &Path,
    output_path: &Path,
    stdout_to_file: bool,
    env: &BTreeMap<String, String>,
) -> std::io::Result<std::process::Child> {
    let (program, args) = command.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty spawn command")
    })?;

    let stdout = if stdout_to_file {
        Stdio::from(std::fs::File::create(output_path)?)
    } else {
        Stdio::null()
    };

    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::null());

    // Detach into a new process group so signals to the parent's group
    // never propagate to workers.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd.spawn()
}

fn cleanup_record_worktree(record: &Spawn) {
    let repo_cwd = resolve_repo_cwd(record);
    let _ = gitbridge::remove_worktree(
        Path::new(&record.worktree_path),
        repo_cwd.as_deref(),
        true,
    );
}

/// Best-effort repository root for worktree cleanup.
fn resolve_repo_cwd(record: &Spawn) -> Option<PathBuf> {
    if !record.repo_cwd.is_empty() {
        return Some(PathBuf::from(&record.repo_cwd));
    }
    let wt = PathBuf::from(&record.worktree_path);
    for parent in wt.ancestors().skip(1) {
        if parent.file_name().is_some_and(|n| n == ".worktrees") {
            return parent.parent().map(Path::to_path_buf);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Process liveness
// ---------------------------------------------------------------------------

/// Signal-0 probe. A process we cannot signal (EPERM) still counts as
/// alive.
#[cfg(unix)]
pub fn pid_alive(pid: i64) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i64) -> bool {
    false
}

/// PID-reuse guard: alive only if the pid answers signal-0 AND its
/// creation time matches the one recorded at spawn. A zero recorded time
/// falls back to the pid-only check.
pub fn is_pid_alive_guarded(pid: i64, expected_create_time: f64) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    if expected_create_time == 0.0 {
        return true;
    }
    let current = get_pid_create_time(pid);
    if current == 0.0 {
        return true;
    }
    // Both values come from the same platform code path.
    (current - expected_create_time).abs() < 1e-6
}

/// Best-effort process creation time as an epoch float; 0.0 when unknown.
pub fn get_pid_create_time(pid: i64) -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Some(ts) = proc_create_time(pid) {
            return ts;
        }
    }
    ps_lstart_create_time(pid).unwrap_or(0.0)
}

/// Linux: starttime ticks from `/proc/<pid>/stat` plus the boot time.
#[cfg(target_os = "linux")]
fn proc_create_time(pid: i64) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesized comm; starttime is field 22 overall.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let starttime_ticks: f64 = fields.get(19)?.parse().ok()?;

    let proc_stat = std::fs::read_to_string("/proc/stat").ok()?;
    let boot_time: f64 = proc_stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if clk_tck <= 0 {
        return None;
    }
    Some(boot_time + starttime_ticks / clk_tck as f64)
}

/// Portable fallback: `ps -o lstart= -p <pid>` parsed as local time.
fn ps_lstart_create_time(pid: i64) -> Option<f64> {
    let output = std::process::Command::new("ps")
        .args(["-o", "lstart=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    // Format: "Mon Jan 1 12:00:00 2024", local time.
    let parsed =
        chrono::NaiveDateTime::parse_from_str(&normalized, "%a %b %d %H:%M:%S %Y").ok()?;
    let local = chrono::Local
        .from_local_datetime(&parsed)
        .earliest()?;
    Some(local.timestamp() as f64)
}

/// Best-effort termination for detached workers: TERM, then KILL.
#[cfg(unix)]
pub fn terminate_pid(pid: i64) {
    unsafe {
        if libc::kill(pid as libc::pid_t, libc::SIGTERM) != 0 {
            return; // already gone
        }
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: i64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_alive_for_self_and_not_for_bogus() {
        let own = std::process::id() as i64;
        assert!(pid_alive(own));
        // PID numbers cap at ~4 million on Linux.
        assert!(!pid_alive(99_999_999));
    }

    #[test]
    fn create_time_guard_detects_reuse() {
        let own = std::process::id() as i64;
        let created = get_pid_create_time(own);
        if created == 0.0 {
            // Platform gave us nothing; the guard degrades to pid-only.
            assert!(is_pid_alive_guarded(own, 0.0));
            return;
        }
        assert!(is_pid_alive_guarded(own, created));
        // A different creation time means the pid was recycled.
        assert!(!is_pid_alive_guarded(own, created - 3600.0));
        // Zero recorded time falls back to the pid-only probe.
        assert!(is_pid_alive_guarded(own, 0.0));
    }

    #[test]
    fn terminate_missing_pid_is_noop() {
        terminate_pid(99_999_999);
    }

    #[test]
    fn sanitized_env_strips_and_merges() {
        // SAFETY: single-threaded test process section.
        unsafe {
            std::env::set_var("CLAUDECODE", "1");
            std::env::set_var("MESH_KEEP_ME", "yes");
            std::env::set_var("MESH_POLICY_SECRET", "hunter2");
        }

        let policy = RepoPolicy {
            worker_runtime: crate::policy::RuntimePolicy {
                strip_env: vec!["MESH_POLICY_SECRET".to_owned()],
            },
            ..Default::default()
        };
        let mut adapter_env = std::collections::HashMap::new();
        adapter_env.insert("MESH_KEEP_ME".to_owned(), "overridden".to_owned());

        let (env, stripped) = sanitized_env(&policy, &adapter_env);
        assert!(!env.contains_key("CLAUDECODE"));
        assert!(!env.contains_key("MESH_POLICY_SECRET"));
        assert_eq!(env.get("MESH_KEEP_ME").map(String::as_str), Some("overridden"));
        assert!(stripped.contains(&"CLAUDECODE".to_owned()));
        assert!(stripped.contains(&"MESH_POLICY_SECRET".to_owned()));

        // The parent environment is untouched.
        assert_eq!(std::env::var("MESH_KEEP_ME").unwrap(), "yes");

        unsafe {
            std::env::remove_var("CLAUDECODE");
            std::env::remove_var("MESH_KEEP_ME");
            std::env::remove_var("MESH_POLICY_SECRET");
        }
    }

    #[test]
    fn trim_summary_keeps_tail() {
        assert_eq!(trim_summary("short", 10), "short");
        assert_eq!(trim_summary("abcdefgh", 3), "fgh");
    }

    #[test]
    fn repo_cwd_resolution_falls_back_to_worktree_layout() {
        let mut record = Spawn {
            spawn_id: "spawn_x".to_owned(),
            task_id: String::new(),
            attempt_id: String::new(),
            agent_id: String::new(),
            pid: 0,
            pid_started_at: 0.0,
            worktree_path: "/repo/.worktrees/spawn_x".to_owned(),
            branch: String::new(),
            episode_id: String::new(),
            context_hash: String::new(),
            started_at: String::new(),
            ended_at: String::new(),
            outcome: String::new(),
            output_path: String::new(),
            repo_cwd: String::new(),
            timeout_s: 0,
            backend: String::new(),
            backend_version: String::new(),
        };
        assert_eq!(resolve_repo_cwd(&record), Some(PathBuf::from("/repo")));

        record.repo_cwd = "/explicit".to_owned();
        assert_eq!(resolve_repo_cwd(&record), Some(PathBuf::from("/explicit")));
    }
}
