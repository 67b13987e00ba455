//! Query functions for the `spawns` table.
//!
//! The finalization CAS lives here: `finalize_spawn` is the sole authority
//! on which caller finalized a spawn. Every side effect of harvest/abort is
//! gated on its return value.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::Spawn;

/// Persist a spawn record.
pub async fn insert_spawn(pool: &SqlitePool, spawn: &Spawn) -> Result<()> {
    sqlx::query(
        "INSERT INTO spawns \
         (spawn_id, task_id, attempt_id, agent_id, pid, pid_started_at, worktree_path, \
          branch, episode_id, context_hash, started_at, ended_at, outcome, output_path, \
          repo_cwd, timeout_s, backend, backend_version) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&spawn.spawn_id)
    .bind(&spawn.task_id)
    .bind(&spawn.attempt_id)
    .bind(&spawn.agent_id)
    .bind(spawn.pid)
    .bind(spawn.pid_started_at)
    .bind(&spawn.worktree_path)
    .bind(&spawn.branch)
    .bind(&spawn.episode_id)
    .bind(&spawn.context_hash)
    .bind(&spawn.started_at)
    .bind(&spawn.ended_at)
    .bind(&spawn.outcome)
    .bind(&spawn.output_path)
    .bind(&spawn.repo_cwd)
    .bind(spawn.timeout_s)
    .bind(&spawn.backend)
    .bind(&spawn.backend_version)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert spawn {}", spawn.spawn_id))?;

    Ok(())
}

/// Fetch a spawn by id.
pub async fn get_spawn(pool: &SqlitePool, spawn_id: &str) -> Result<Option<Spawn>> {
    let spawn = sqlx::query_as::<_, Spawn>("SELECT * FROM spawns WHERE spawn_id = ?")
        .bind(spawn_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch spawn {spawn_id}"))?;

    Ok(spawn)
}

/// List spawns, optionally restricted to those not yet finalized.
pub async fn list_spawns(pool: &SqlitePool, active_only: bool) -> Result<Vec<Spawn>> {
    let query = if active_only {
        "SELECT * FROM spawns WHERE ended_at = '' ORDER BY started_at"
    } else {
        "SELECT * FROM spawns ORDER BY started_at"
    };
    let spawns = sqlx::query_as::<_, Spawn>(query)
        .fetch_all(pool)
        .await
        .context("failed to list spawns")?;

    Ok(spawns)
}

/// The finalization CAS. Sets `(ended_at, outcome)` only when `ended_at`
/// is still empty; the row count decides the winner. Returns `true` iff
/// this caller won.
pub async fn finalize_spawn(
    pool: &SqlitePool,
    spawn_id: &str,
    ended_at: &str,
    outcome: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE spawns SET ended_at = ?, outcome = ? \
         WHERE spawn_id = ? AND ended_at = ''",
    )
    .bind(ended_at)
    .bind(outcome)
    .bind(spawn_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to finalize spawn {spawn_id}"))?;

    Ok(result.rows_affected() > 0)
}

/// Rewrite a finalized spawn's outcome (verification downgrade path).
pub async fn update_spawn_outcome(pool: &SqlitePool, spawn_id: &str, outcome: &str) -> Result<()> {
    sqlx::query("UPDATE spawns SET outcome = ? WHERE spawn_id = ?")
        .bind(outcome)
        .bind(spawn_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to update outcome of spawn {spawn_id}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataDir;
    use crate::models::{Task, TaskState, new_id, now_ts};
    use crate::pool::connect_and_migrate;
    use crate::queries::tasks::insert_task;
    use sqlx::types::Json;
    use tempfile::TempDir;

    async fn seed(pool: &SqlitePool) -> Spawn {
        let now = now_ts();
        let task = Task {
            task_id: new_id("task"),
            title: "t".to_owned(),
            description: String::new(),
            state: TaskState::Running,
            assigned_agent_id: "a1".to_owned(),
            episode_id: String::new(),
            branch: "feat/x".to_owned(),
            pr_url: String::new(),
            parent_task_id: String::new(),
            meta: Json(serde_json::json!({})),
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        insert_task(pool, &task, &[]).await.unwrap();

        let spawn = Spawn {
            spawn_id: new_id("spawn"),
            task_id: task.task_id,
            attempt_id: new_id("att"),
            agent_id: "a1".to_owned(),
            pid: 12345,
            pid_started_at: 0.0,
            worktree_path: "/tmp/wt".to_owned(),
            branch: "feat/x".to_owned(),
            episode_id: String::new(),
            context_hash: "sha256:abc".to_owned(),
            started_at: now,
            ended_at: String::new(),
            outcome: String::new(),
            output_path: "/tmp/out.json".to_owned(),
            repo_cwd: "/tmp/repo".to_owned(),
            timeout_s: 0,
            backend: "claude_code".to_owned(),
            backend_version: String::new(),
        };
        insert_spawn(pool, &spawn).await.unwrap();
        spawn
    }

    #[tokio::test]
    async fn finalize_cas_single_winner() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();
        let spawn = seed(&pool).await;

        let won = finalize_spawn(&pool, &spawn.spawn_id, &now_ts(), "success")
            .await
            .unwrap();
        assert!(won);

        let lost = finalize_spawn(&pool, &spawn.spawn_id, &now_ts(), "aborted")
            .await
            .unwrap();
        assert!(!lost, "second finalizer must lose the CAS");

        let row = get_spawn(&pool, &spawn.spawn_id).await.unwrap().unwrap();
        assert_eq!(row.outcome, "success");
        assert!(!row.ended_at.is_empty());
    }

    #[tokio::test]
    async fn active_only_listing_excludes_finalized() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();
        let spawn = seed(&pool).await;

        assert_eq!(list_spawns(&pool, true).await.unwrap().len(), 1);
        finalize_spawn(&pool, &spawn.spawn_id, &now_ts(), "failure")
            .await
            .unwrap();
        assert!(list_spawns(&pool, true).await.unwrap().is_empty());
        assert_eq!(list_spawns(&pool, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_finalize_has_exactly_one_winner() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();
        let spawn = seed(&pool).await;

        let ts_a = now_ts();
        let ts_b = now_ts();
        let (a, b) = tokio::join!(
            finalize_spawn(&pool, &spawn.spawn_id, &ts_a, "success"),
            finalize_spawn(&pool, &spawn.spawn_id, &ts_b, "aborted"),
        );
        let wins = [a.unwrap(), b.unwrap()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
    }
}
