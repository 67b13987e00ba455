//! Write transactions that take the SQLite write lock up front.
//!
//! A deferred transaction that reads and then writes can land on a stale
//! snapshot when another writer commits in between, surfacing as a busy
//! error. Read-modify-write sequences that must serialize (weave sequence
//! allocation, task transitions) run under `BEGIN IMMEDIATE` instead: the
//! write lock is held from the first statement, so concurrent callers
//! queue on the busy timeout rather than racing.

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use sqlx::{SqliteConnection, SqlitePool};

/// The boxed future type produced by an [`immediate`] transaction body.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Run `op` inside a `BEGIN IMMEDIATE` transaction. Commits on `Ok`,
/// rolls back on `Err`.
pub async fn immediate<T, F>(pool: &SqlitePool, mut op: F) -> Result<T>
where
    F: for<'c> FnMut(&'c mut SqliteConnection) -> TxFuture<'c, T>,
{
    let mut conn = pool
        .acquire()
        .await
        .context("failed to acquire store connection")?;

    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .context("failed to begin immediate transaction")?;

    match op(&mut conn).await {
        Ok(value) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .context("failed to commit transaction")?;
            Ok(value)
        }
        Err(err) => {
            // The connection returns to the pool; it must not carry an
            // open transaction.
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataDir;
    use crate::pool::connect_and_migrate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn commit_on_ok() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();

        immediate(&pool, |conn| {
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO episodes (episode_id, title, started_at) VALUES ('ep_x', '', 't')",
                )
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn rollback_on_err() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();

        let result: Result<()> = immediate(&pool, |conn| {
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO episodes (episode_id, title, started_at) VALUES ('ep_x', '', 't')",
                )
                .execute(&mut *conn)
                .await?;
                anyhow::bail!("abort")
            })
        })
        .await;
        assert!(result.is_err());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);

        // The pooled connection must be reusable afterwards.
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
    }
}
