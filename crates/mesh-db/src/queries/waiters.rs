//! Query functions for the `waiters` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{ResourceType, Waiter};

/// Record a waiter on a resource.
pub async fn add_waiter(pool: &SqlitePool, waiter: &Waiter) -> Result<()> {
    sqlx::query(
        "INSERT INTO waiters \
         (waiter_id, resource_type, path, waiter_agent_id, episode_id, priority, reason, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&waiter.waiter_id)
    .bind(waiter.resource_type)
    .bind(&waiter.path)
    .bind(&waiter.waiter_agent_id)
    .bind(&waiter.episode_id)
    .bind(waiter.priority)
    .bind(&waiter.reason)
    .bind(&waiter.created_at)
    .execute(pool)
    .await
    .with_context(|| format!("failed to add waiter {}", waiter.waiter_id))?;

    Ok(())
}

/// List waiters on one resource, oldest first.
pub async fn list_waiters(
    pool: &SqlitePool,
    resource_type: ResourceType,
    path: &str,
) -> Result<Vec<Waiter>> {
    let waiters = sqlx::query_as::<_, Waiter>(
        "SELECT * FROM waiters WHERE path = ? AND resource_type = ? ORDER BY created_at",
    )
    .bind(path)
    .bind(resource_type)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list waiters on {path}"))?;

    Ok(waiters)
}

/// Drop all waiters on a resource (consumed when the holder releases).
/// Returns the count removed.
pub async fn clear_waiters(
    pool: &SqlitePool,
    resource_type: ResourceType,
    path: &str,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM waiters WHERE path = ? AND resource_type = ?")
        .bind(path)
        .bind(resource_type)
        .execute(pool)
        .await
        .with_context(|| format!("failed to clear waiters on {path}"))?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataDir;
    use crate::models::{new_id, now_ts};
    use crate::pool::connect_and_migrate;
    use tempfile::TempDir;

    fn waiter(agent: &str, path: &str, priority: i64) -> Waiter {
        Waiter {
            waiter_id: new_id("wait"),
            resource_type: ResourceType::File,
            path: path.to_owned(),
            waiter_agent_id: agent.to_owned(),
            episode_id: String::new(),
            priority,
            reason: String::new(),
            created_at: now_ts(),
        }
    }

    #[tokio::test]
    async fn add_list_clear_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();

        add_waiter(&pool, &waiter("a1", "/tmp/x", 3)).await.unwrap();
        add_waiter(&pool, &waiter("a2", "/tmp/x", 8)).await.unwrap();
        add_waiter(&pool, &waiter("a3", "/tmp/y", 5)).await.unwrap();

        let on_x = list_waiters(&pool, ResourceType::File, "/tmp/x").await.unwrap();
        assert_eq!(on_x.len(), 2);
        assert_eq!(on_x[0].waiter_agent_id, "a1");

        let removed = clear_waiters(&pool, ResourceType::File, "/tmp/x").await.unwrap();
        assert_eq!(removed, 2);
        assert!(
            list_waiters(&pool, ResourceType::File, "/tmp/x")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            list_waiters(&pool, ResourceType::File, "/tmp/y")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
