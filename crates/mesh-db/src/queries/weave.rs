//! Query functions for the `weave_events` table.
//!
//! The weave is the in-store provenance ledger: sequence ids are allocated
//! inside the same transaction as the row insert, so they are gap-free and
//! duplicate-free across concurrent appenders. The UNIQUE constraint on
//! `sequence_id` is the integrity backstop; contention surfaces as a busy
//! error and is retried by the caller.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::WeaveEvent;

/// The last `(sequence_id, event_hash)` pair, or `None` on an empty ledger.
pub async fn last_chain_state<'e, E>(executor: E) -> Result<Option<(i64, String)>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT sequence_id, event_hash FROM weave_events \
         ORDER BY sequence_id DESC LIMIT 1",
    )
    .fetch_optional(executor)
    .await
    .context("failed to read weave chain state")?;

    Ok(row)
}

/// Insert a fully-built weave record. The caller computes `sequence_id`,
/// `prev_hash`, and `event_hash` from [`last_chain_state`] inside the same
/// transaction.
pub async fn insert_weave_event<'e, E>(executor: E, event: &WeaveEvent) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO weave_events \
         (event_id, sequence_id, episode_id, prev_hash, capsule_id, git_commit_sha, \
          git_patch_hash, affected_symbols, trace_id, parent_event_id, event_hash, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.event_id)
    .bind(event.sequence_id)
    .bind(&event.episode_id)
    .bind(&event.prev_hash)
    .bind(&event.capsule_id)
    .bind(&event.git_commit_sha)
    .bind(&event.git_patch_hash)
    .bind(&event.affected_symbols)
    .bind(&event.trace_id)
    .bind(&event.parent_event_id)
    .bind(&event.event_hash)
    .bind(&event.created_at)
    .execute(executor)
    .await
    .with_context(|| format!("failed to insert weave event {}", event.event_id))?;

    Ok(())
}

/// List weave events in sequence order, optionally scoped to an episode.
pub async fn list_weave_events(
    pool: &SqlitePool,
    episode_id: Option<&str>,
) -> Result<Vec<WeaveEvent>> {
    let events = match episode_id {
        Some(ep) => {
            sqlx::query_as::<_, WeaveEvent>(
                "SELECT * FROM weave_events WHERE episode_id = ? ORDER BY sequence_id",
            )
            .bind(ep)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, WeaveEvent>("SELECT * FROM weave_events ORDER BY sequence_id")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list weave events")?;

    Ok(events)
}

/// Number of weave records.
pub async fn count_weave_events(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM weave_events")
        .fetch_one(pool)
        .await
        .context("failed to count weave events")?;

    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataDir;
    use crate::models::{new_id, now_ts};
    use crate::pool::connect_and_migrate;
    use sqlx::types::Json;
    use tempfile::TempDir;

    fn event(sequence_id: i64, prev_hash: &str) -> WeaveEvent {
        WeaveEvent {
            event_id: new_id("weave"),
            sequence_id,
            episode_id: String::new(),
            prev_hash: prev_hash.to_owned(),
            capsule_id: String::new(),
            git_commit_sha: String::new(),
            git_patch_hash: String::new(),
            affected_symbols: Json(vec![]),
            trace_id: String::new(),
            parent_event_id: String::new(),
            event_hash: format!("sha256:{sequence_id:064}"),
            created_at: now_ts(),
        }
    }

    #[tokio::test]
    async fn chain_state_tracks_last_insert() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();

        assert!(last_chain_state(&pool).await.unwrap().is_none());

        insert_weave_event(&pool, &event(1, "genesis")).await.unwrap();
        insert_weave_event(&pool, &event(2, "sha256:1")).await.unwrap();

        let (seq, hash) = last_chain_state(&pool).await.unwrap().unwrap();
        assert_eq!(seq, 2);
        assert!(hash.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn duplicate_sequence_id_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = connect_and_migrate(&DataDir::new(dir.path())).await.unwrap();

        insert_weave_event(&pool, &event(1, "genesis")).await.unwrap();
        let dup = insert_weave_event(&pool, &event(1, "genesis")).await;
        assert!(dup.is_err(), "UNIQUE(sequence_id) must reject duplicates");
    }
}
