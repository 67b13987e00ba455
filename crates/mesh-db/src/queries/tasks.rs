//! Query functions for the `tasks` and `task_deps` tables.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Task, TaskState};

/// Insert a task together with its dependency edges, in one transaction.
///
/// Cycle detection happens in the task machine before this is called; the
/// foreign keys on `task_deps` still reject edges to unknown tasks.
pub async fn insert_task(pool: &SqlitePool, task: &Task, depends_on: &[String]) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin task insert")?;

    sqlx::query(
        "INSERT INTO tasks \
         (task_id, title, description, state, assigned_agent_id, episode_id, \
          branch, pr_url, parent_task_id, meta, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.task_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.state)
    .bind(&task.assigned_agent_id)
    .bind(&task.episode_id)
    .bind(&task.branch)
    .bind(&task.pr_url)
    .bind(&task.parent_task_id)
    .bind(&task.meta)
    .bind(&task.created_at)
    .bind(&task.updated_at)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("failed to insert task {}", task.task_id))?;

    for dep in depends_on {
        sqlx::query(
            "INSERT INTO task_deps (task_id, depends_on) VALUES (?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&task.task_id)
        .bind(dep)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert dependency {} -> {dep}", task.task_id))?;
    }

    tx.commit().await.context("failed to commit task insert")?;
    Ok(())
}

/// Fetch a single task by id. Generic over the executor so the task
/// machine can read inside its own transaction.
pub async fn get_task<'e, E>(executor: E, task_id: &str) -> Result<Option<Task>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(executor)
        .await
        .with_context(|| format!("failed to fetch task {task_id}"))?;

    Ok(task)
}

/// List tasks, newest last, optionally filtered by assigned agent.
pub async fn list_tasks(
    pool: &SqlitePool,
    assigned_agent_id: Option<&str>,
    limit: i64,
) -> Result<Vec<Task>> {
    let tasks = match assigned_agent_id {
        Some(agent) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE assigned_agent_id = ? \
                 ORDER BY created_at LIMIT ?",
            )
            .bind(agent)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Optional field updates that ride along with a state transition.
#[derive(Debug, Clone, Default)]
pub struct TaskFieldUpdate {
    pub assigned_agent_id: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
}

/// Apply a state change plus any extra fields. `None` fields keep their
/// current value. The executor parameter lets the task machine run this
/// inside the same transaction as the weave receipt.
pub async fn update_task_state<'e, E>(
    executor: E,
    task_id: &str,
    state: TaskState,
    updated_at: &str,
    fields: &TaskFieldUpdate,
) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE tasks SET state = ?, updated_at = ?, \
         assigned_agent_id = COALESCE(?, assigned_agent_id), \
         branch = COALESCE(?, branch), \
         pr_url = COALESCE(?, pr_url) \
         WHERE task_id = ?",
    )
    .bind(state)
    .bind(updated_at)
    .bind(&fields.assigned_agent_id)
    .bind(&fields.branch)
    .bind(&fields.pr_url)
    .bind(task_id)
    .execute(executor)
    .await
    .with_context(|| format!("failed to update task {task_id}"))?;

    Ok(result.rows_affected())
}

/// The ids a task depends on.
pub async fn get_dependencies(pool: &SqlitePool, task_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT depends_on FROM task_deps WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .with_context(|| format!("failed to get dependencies of {task_id}"))?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Every dependency edge in the store, for cycle detection.
pub async fn all_dependency_edges(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT task_id, depends_on FROM task_deps")
            .fetch_all(pool)
            .await
            .context("failed to list dependency edges")?;

    Ok(rows)
}

/// States of a task's direct dependencies, as `(task_id, state)` pairs.
pub async fn dependency_states(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<Vec<(String, TaskState)>> {
    let rows: Vec<(String, TaskState)> = sqlx::query_as(
        "SELECT dep.task_id, dep.state FROM task_deps td \
         JOIN tasks dep ON dep.task_id = td.depends_on \
         WHERE td.task_id = ?",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to get dependency states of {task_id}"))?;

    Ok(rows)
}
