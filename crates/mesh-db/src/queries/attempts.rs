//! Query functions for the `attempts` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Attempt, now_ts};

/// Insert an attempt row.
pub async fn insert_attempt(pool: &SqlitePool, attempt: &Attempt) -> Result<()> {
    sqlx::query(
        "INSERT INTO attempts \
         (attempt_id, task_id, agent_id, attempt_number, started_at, ended_at, outcome, error_summary) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&attempt.attempt_id)
    .bind(&attempt.task_id)
    .bind(&attempt.agent_id)
    .bind(attempt.attempt_number)
    .bind(&attempt.started_at)
    .bind(&attempt.ended_at)
    .bind(&attempt.outcome)
    .bind(&attempt.error_summary)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert attempt {}", attempt.attempt_id))?;

    Ok(())
}

/// List a task's attempts in attempt order.
pub async fn list_attempts(pool: &SqlitePool, task_id: &str) -> Result<Vec<Attempt>> {
    let attempts = sqlx::query_as::<_, Attempt>(
        "SELECT * FROM attempts WHERE task_id = ? ORDER BY attempt_number",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list attempts for {task_id}"))?;

    Ok(attempts)
}

/// Close an attempt. Only open attempts (`ended_at = ''`) are touched, so a
/// second close is a no-op. Returns `true` if this call closed it.
pub async fn end_attempt(
    pool: &SqlitePool,
    attempt_id: &str,
    outcome: &str,
    error_summary: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE attempts SET ended_at = ?, outcome = ?, error_summary = ? \
         WHERE attempt_id = ? AND ended_at = ''",
    )
    .bind(now_ts())
    .bind(outcome)
    .bind(error_summary)
    .bind(attempt_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to end attempt {attempt_id}"))?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataDir;
    use crate::models::{Task, TaskState, new_id};
    use crate::pool::connect_and_migrate;
    use crate::queries::tasks::insert_task;
    use sqlx::types::Json;
    use tempfile::TempDir;

    async fn seed_task(pool: &SqlitePool) -> String {
        let now = now_ts();
        let task = Task {
            task_id: new_id("task"),
            title: "t".to_owned(),
            description: String::new(),
            state: TaskState::Planned,
            assigned_agent_id: String::new(),
            episode_id: String::new(),
            branch: String::new(),
            pr_url: String::new(),
            parent_task_id: String::new(),
            meta: Json(serde_json::json!({})),
            created_at: now.clone(),
            updated_at: now,
        };
        insert_task(pool, &task, &[]).await.unwrap();
        task.task_id
    }

    fn attempt(task_id: &str, number: i64) -> Attempt {
        Attempt {
            attempt_id: new_id("att"),
            task_id: task_id.to_owned(),
            agent_id: "a1".to_owned(),
            attempt_number: number,
            started_at: now_ts(),
            ended_at: String::new(),
            outcome: String::new(),
            error_summary: String::new(),
        }
    }

    #[tokio::test]
    async fn attempts_ordered_by_number() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();
        let task_id = seed_task(&pool).await;

        insert_attempt(&pool, &attempt(&task_id, 2)).await.unwrap();
        insert_attempt(&pool, &attempt(&task_id, 1)).await.unwrap();

        let listed = list_attempts(&pool, &task_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].attempt_number, 1);
        assert_eq!(listed[1].attempt_number, 2);
    }

    #[tokio::test]
    async fn end_attempt_is_single_shot() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();
        let task_id = seed_task(&pool).await;

        let att = attempt(&task_id, 1);
        insert_attempt(&pool, &att).await.unwrap();

        assert!(end_attempt(&pool, &att.attempt_id, "success", "").await.unwrap());
        // Already closed: second call must not overwrite the outcome.
        assert!(!end_attempt(&pool, &att.attempt_id, "failure", "boom").await.unwrap());

        let listed = list_attempts(&pool, &task_id).await.unwrap();
        assert_eq!(listed[0].outcome, "success");
        assert!(!listed[0].ended_at.is_empty());
    }
}
