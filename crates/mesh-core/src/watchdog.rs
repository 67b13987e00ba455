//! Watchdog: periodic reconciliation of observed liveness with declared
//! state.
//!
//! One scan pass covers stale agents, dead-worker harvest, timeout
//! aborts, and per-task cost budgets. Before each action the target row
//! is re-read and skipped if the guarding field changed underneath us; a
//! race can only cost us one scan, never a duplicate side effect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;

use mesh_db::config::DataDir;
use mesh_db::models::{EventKind, Spawn, now_minus_secs};
use mesh_db::queries::agents as agents_db;
use mesh_db::queries::claims as claims_db;
use mesh_db::queries::spawns as spawns_db;
use mesh_db::queries::tasks as tasks_db;

use crate::adapter::AdapterRegistry;
use crate::eventlog::EventLog;
use crate::machine;
use crate::spawner;

/// Agents are stale after 5 minutes without a heartbeat.
pub const DEFAULT_STALE_THRESHOLD_S: i64 = 300;

/// Everything one scan pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogResult {
    pub stale_agents: Vec<String>,
    pub reaped_agents: Vec<String>,
    pub aborted_tasks: Vec<String>,
    pub harvested_spawns: Vec<String>,
    pub timed_out_spawns: Vec<String>,
    pub cost_exceeded_tasks: Vec<String>,
}

impl WatchdogResult {
    /// True when the scan found nothing to reconcile.
    pub fn clean(&self) -> bool {
        self.stale_agents.is_empty()
            && self.reaped_agents.is_empty()
            && self.aborted_tasks.is_empty()
            && self.harvested_spawns.is_empty()
            && self.timed_out_spawns.is_empty()
            && self.cost_exceeded_tasks.is_empty()
    }
}

/// Run one watchdog pass.
///
/// `default_timeout_s` applies to spawns recorded without their own
/// timeout; zero leaves those unbounded.
pub async fn scan(
    pool: &SqlitePool,
    data_dir: &DataDir,
    registry: &AdapterRegistry,
    stale_threshold_s: i64,
    default_timeout_s: i64,
) -> anyhow::Result<WatchdogResult> {
    let mut result = WatchdogResult::default();

    reap_stale_agents(pool, data_dir, stale_threshold_s, &mut result).await?;
    harvest_dead_spawns(pool, data_dir, registry, &mut result).await?;
    abort_timed_out_spawns(pool, data_dir, default_timeout_s, &mut result).await?;
    enforce_cost_budgets(pool, data_dir, &mut result).await?;

    if !result.clean() {
        EventLog::new(data_dir).append(
            EventKind::Gc,
            "",
            json!({
                "watchdog": "scan",
                "stale_agents": &result.stale_agents,
                "reaped": result.reaped_agents.len(),
                "aborted_tasks": &result.aborted_tasks,
                "harvested_spawns": &result.harvested_spawns,
                "timed_out_spawns": &result.timed_out_spawns,
                "cost_exceeded_tasks": &result.cost_exceeded_tasks,
            }),
        )?;
    }

    Ok(result)
}

/// Mark heartbeat-stale agents gone, release their claims, and abort
/// their non-terminal tasks.
async fn reap_stale_agents(
    pool: &SqlitePool,
    data_dir: &DataDir,
    stale_threshold_s: i64,
    result: &mut WatchdogResult,
) -> anyhow::Result<()> {
    let cutoff = now_minus_secs(stale_threshold_s);
    let agents = agents_db::list_agents(pool, false).await?;

    for agent in agents {
        if agent.last_heartbeat >= cutoff {
            continue;
        }
        result.stale_agents.push(agent.agent_id.clone());

        agents_db::deregister_agent(pool, &agent.agent_id).await?;
        claims_db::release_claim(
            pool,
            &agent.agent_id,
            mesh_db::models::ResourceType::File,
            None,
            true,
        )
        .await?;
        result.reaped_agents.push(agent.agent_id.clone());

        let tasks = tasks_db::list_tasks(pool, Some(&agent.agent_id), 5000).await?;
        for task in tasks {
            if task.state.is_terminal() {
                continue;
            }
            match machine::abort(
                pool,
                data_dir,
                &task.task_id,
                "worker heartbeat stale",
                &agent.agent_id,
            )
            .await
            {
                Ok(_) => result.aborted_tasks.push(task.task_id),
                Err(err) if err.is_terminal_state() => {}
                Err(err) => {
                    tracing::warn!(task_id = %task.task_id, %err, "stale-agent abort failed");
                }
            }
        }
    }
    Ok(())
}

/// Harvest spawns whose worker process is gone. Unknown backends still
/// finalize through harvest's fail-closed parse path.
async fn harvest_dead_spawns(
    pool: &SqlitePool,
    data_dir: &DataDir,
    registry: &AdapterRegistry,
    result: &mut WatchdogResult,
) -> anyhow::Result<()> {
    for spawn in spawns_db::list_spawns(pool, true).await? {
        // Re-read: another caller may have finalized since the listing.
        let Some(fresh) = spawns_db::get_spawn(pool, &spawn.spawn_id).await? else {
            continue;
        };
        if !fresh.ended_at.is_empty() {
            continue;
        }
        if spawner::is_pid_alive_guarded(fresh.pid, fresh.pid_started_at) {
            continue;
        }

        match spawner::harvest(pool, data_dir, registry, &fresh.spawn_id, true).await {
            Ok(_) => result.harvested_spawns.push(fresh.spawn_id),
            Err(
                spawner::SpawnError::AlreadyHarvested(_)
                | spawner::SpawnError::RaceLost(_)
                | spawner::SpawnError::StillRunning { .. },
            ) => {}
            Err(err) => {
                tracing::warn!(spawn_id = %fresh.spawn_id, %err, "dead-worker harvest failed");
            }
        }
    }
    Ok(())
}

/// Abort live spawns that outran their timeout.
async fn abort_timed_out_spawns(
    pool: &SqlitePool,
    data_dir: &DataDir,
    default_timeout_s: i64,
    result: &mut WatchdogResult,
) -> anyhow::Result<()> {
    let now = Utc::now();
    for spawn in spawns_db::list_spawns(pool, true).await? {
        let timeout_s = if spawn.timeout_s > 0 {
            spawn.timeout_s
        } else {
            default_timeout_s
        };
        if timeout_s <= 0 {
            continue;
        }
        let Some(started) = parse_ts(&spawn.started_at) else {
            continue;
        };
        if (now - started).num_seconds() <= timeout_s {
            continue;
        }
        if !spawner::is_pid_alive_guarded(spawn.pid, spawn.pid_started_at) {
            continue; // dead workers belong to the harvest pass
        }

        let Some(fresh) = spawns_db::get_spawn(pool, &spawn.spawn_id).await? else {
            continue;
        };
        if !fresh.ended_at.is_empty() {
            continue;
        }

        match spawner::abort(pool, data_dir, &fresh.spawn_id, "timeout", true).await {
            Ok(_) => result.timed_out_spawns.push(fresh.spawn_id),
            Err(spawner::SpawnError::AlreadyEnded { .. } | spawner::SpawnError::RaceLost(_)) => {}
            Err(err) => {
                tracing::warn!(spawn_id = %fresh.spawn_id, %err, "timeout abort failed");
            }
        }
    }
    Ok(())
}

/// Enforce `meta.max_cost_usd` on running tasks by summing the cost of
/// their prior `WORKER_DONE` events.
async fn enforce_cost_budgets(
    pool: &SqlitePool,
    data_dir: &DataDir,
    result: &mut WatchdogResult,
) -> anyhow::Result<()> {
    let log = EventLog::new(data_dir);
    let events = log.read(0)?;
    let tasks = tasks_db::list_tasks(pool, None, 5000).await?;

    for task in tasks {
        if task.state != mesh_db::models::TaskState::Running {
            continue;
        }
        let Some(budget) = task.meta.0.get("max_cost_usd").and_then(|v| v.as_f64()) else {
            continue;
        };

        let spent: f64 = events
            .iter()
            .filter(|e| e.kind == EventKind::WorkerDone)
            .filter(|e| e.payload.get("task_id").and_then(|v| v.as_str()) == Some(&task.task_id))
            .filter_map(|e| e.payload.get("cost_usd").and_then(|v| v.as_f64()))
            .sum();
        if spent <= budget {
            continue;
        }

        let active: Vec<Spawn> = spawns_db::list_spawns(pool, true)
            .await?
            .into_iter()
            .filter(|s| s.task_id == task.task_id)
            .collect();
        if active.is_empty() {
            continue;
        }

        log.append(
            EventKind::CostExceeded,
            &task.assigned_agent_id,
            json!({
                "task_id": &task.task_id,
                "budget_usd": budget,
                "spent_usd": spent,
            }),
        )?;

        for spawn in active {
            match spawner::abort(pool, data_dir, &spawn.spawn_id, "cost_exceeded", true).await {
                Ok(_) => {}
                Err(
                    spawner::SpawnError::AlreadyEnded { .. } | spawner::SpawnError::RaceLost(_),
                ) => {}
                Err(err) => {
                    tracing::warn!(spawn_id = %spawn.spawn_id, %err, "cost abort failed");
                }
            }
        }
        result.cost_exceeded_tasks.push(task.task_id);
    }
    Ok(())
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
