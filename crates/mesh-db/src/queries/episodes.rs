//! Query functions for the `episodes` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::Episode;

/// Insert an episode row.
pub async fn insert_episode(pool: &SqlitePool, episode: &Episode) -> Result<()> {
    sqlx::query(
        "INSERT INTO episodes (episode_id, title, started_at, ended_at, parent_episode_id) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&episode.episode_id)
    .bind(&episode.title)
    .bind(&episode.started_at)
    .bind(&episode.ended_at)
    .bind(&episode.parent_episode_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert episode {}", episode.episode_id))?;

    Ok(())
}

/// Fetch an episode by id.
pub async fn get_episode(pool: &SqlitePool, episode_id: &str) -> Result<Option<Episode>> {
    let episode = sqlx::query_as::<_, Episode>("SELECT * FROM episodes WHERE episode_id = ?")
        .bind(episode_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch episode {episode_id}"))?;

    Ok(episode)
}

/// Stamp an episode's end time. Returns `true` if the row existed.
pub async fn end_episode(pool: &SqlitePool, episode_id: &str, ended_at: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE episodes SET ended_at = ? WHERE episode_id = ?")
        .bind(ended_at)
        .bind(episode_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to end episode {episode_id}"))?;

    Ok(result.rows_affected() > 0)
}
