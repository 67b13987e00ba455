//! Assay bridge: one `ASSAY_RECEIPT` event per terminal task transition.
//!
//! Assay is an optional external gate. The bridge runs `assay gate check`
//! and records either the gate report (`BRIDGE_EMIT_OK`) or the reason it
//! could not run (`BRIDGE_EMIT_DEGRADED`). Degraded outcomes are recorded,
//! never silently skipped, and the bridge itself never fails the
//! transition that triggered it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use sqlx::SqlitePool;

use mesh_db::config::DataDir;
use mesh_db::models::{EventKind, TaskState};
use mesh_db::queries::spawns as spawns_db;

use crate::eventlog::EventLog;

const STATUS_OK: &str = "BRIDGE_EMIT_OK";
const STATUS_DEGRADED: &str = "BRIDGE_EMIT_DEGRADED";

/// Outcome of one bridge emission.
#[derive(Debug, Clone)]
pub struct BridgeResult {
    pub status: String,
    pub gate_report: Value,
    /// Empty on OK, human-readable on degraded.
    pub reason: String,
}

/// Run the assay gate for a task's repo and append the receipt event.
/// Infallible by contract: every failure path degrades into the receipt.
pub async fn emit_bridge_event(
    pool: &SqlitePool,
    data_dir: &DataDir,
    task_id: &str,
    terminal_state: TaskState,
    agent_id: &str,
    episode_id: &str,
) -> BridgeResult {
    let repo_path = find_repo_path(pool, task_id).await;

    let (status, gate_report, reason) = match repo_path {
        Some(path) if path.is_dir() => run_assay_gate(&path).await,
        _ => (
            STATUS_DEGRADED.to_owned(),
            json!({}),
            "no repo path found for task".to_owned(),
        ),
    };

    let mut payload = json!({
        "task_id": task_id,
        "terminal_state": terminal_state,
        "bridge_status": &status,
        "gate_report": &gate_report,
        // Evidence Wire Protocol v0 envelope
        "_ewp_version": "0",
        "_ewp_task_id": task_id,
        "_ewp_origin": "agentmesh/assay_bridge",
    });
    if !episode_id.is_empty() {
        payload["episode_id"] = json!(episode_id);
    }
    if !reason.is_empty() {
        payload["reason"] = json!(&reason);
    }

    if let Err(err) = EventLog::new(data_dir).append(EventKind::AssayReceipt, agent_id, payload) {
        tracing::warn!(task_id, %err, "failed to append assay receipt");
    }

    BridgeResult {
        status,
        gate_report,
        reason,
    }
}

/// Repo root for a task: the latest spawn's recorded `repo_cwd`, else the
/// process cwd when it looks like a git repo (CLI-driven flows with no
/// spawn record).
async fn find_repo_path(pool: &SqlitePool, task_id: &str) -> Option<PathBuf> {
    let spawns = spawns_db::list_spawns(pool, false).await.unwrap_or_default();
    let last_for_task = spawns
        .iter()
        .filter(|s| s.task_id == task_id && !s.repo_cwd.is_empty())
        .next_back();
    if let Some(spawn) = last_for_task {
        return Some(PathBuf::from(&spawn.repo_cwd));
    }

    let cwd = std::env::current_dir().ok()?;
    if cwd.join(".git").is_dir() {
        return Some(cwd);
    }
    None
}

async fn run_assay_gate(repo_path: &Path) -> (String, Value, String) {
    if which("assay").is_none() {
        return (
            STATUS_DEGRADED.to_owned(),
            json!({}),
            "assay CLI not found on PATH".to_owned(),
        );
    }

    let mut command = tokio::process::Command::new("assay");
    command
        .arg("gate")
        .arg("check")
        .arg(repo_path)
        .args(["--min-score", "0", "--json"])
        .kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_secs(30), command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return (
                STATUS_DEGRADED.to_owned(),
                json!({}),
                format!("failed to start assay: {err}"),
            );
        }
        Err(_) => {
            return (
                STATUS_DEGRADED.to_owned(),
                json!({}),
                "assay gate check timed out".to_owned(),
            );
        }
    };

    if output.status.code() == Some(3) {
        return (
            STATUS_DEGRADED.to_owned(),
            json!({}),
            "assay gate check: bad input".to_owned(),
        );
    }

    match serde_json::from_slice::<Value>(&output.stdout) {
        // Exit 0 (pass) and 1 (fail) are both valid gate results.
        Ok(report) => (STATUS_OK.to_owned(), report, String::new()),
        Err(_) => (
            STATUS_DEGRADED.to_owned(),
            json!({}),
            "assay returned non-JSON output".to_owned(),
        ),
    }
}

fn which(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
