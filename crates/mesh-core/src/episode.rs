//! Episode lifecycle.
//!
//! An episode groups related claims, tasks, and weave receipts under one
//! lexicographically sortable id. The current episode is a single-line
//! marker file in the data directory so every process sharing it agrees.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::SqlitePool;

use mesh_db::config::DataDir;
use mesh_db::models::{Episode, EventKind, now_ts};
use mesh_db::queries::episodes as episodes_db;

use crate::eventlog::EventLog;

/// Generate an episode id: `ep_` + 48-bit millisecond timestamp + 48-bit
/// random, hex-encoded. 27 chars, sortable by creation time.
pub fn generate_episode_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis() as u64;
    let ts_bytes = &ms.to_be_bytes()[2..]; // low 48 bits
    let rand_bits: u64 = rand::rng().random_range(0..(1u64 << 48));
    let rand_bytes = &rand_bits.to_be_bytes()[2..];
    let mut raw = Vec::with_capacity(12);
    raw.extend_from_slice(ts_bytes);
    raw.extend_from_slice(rand_bytes);
    format!("ep_{}", hex::encode(raw))
}

/// Start a new episode, set it current, and log `EPISODE_START`.
pub async fn start_episode(
    pool: &SqlitePool,
    data_dir: &DataDir,
    title: &str,
    parent_episode_id: &str,
) -> Result<String> {
    let episode = Episode {
        episode_id: generate_episode_id(),
        title: title.to_owned(),
        started_at: now_ts(),
        ended_at: String::new(),
        parent_episode_id: parent_episode_id.to_owned(),
    };
    episodes_db::insert_episode(pool, &episode).await?;
    set_current_episode(data_dir, &episode.episode_id)?;

    EventLog::new(data_dir).append(
        EventKind::EpisodeStart,
        "",
        serde_json::json!({
            "episode_id": &episode.episode_id,
            "title": title,
            "parent_episode_id": parent_episode_id,
        }),
    )?;

    Ok(episode.episode_id)
}

/// The current episode id, or empty when none is set.
pub fn current_episode(data_dir: &DataDir) -> String {
    let path = data_dir.current_episode_file();
    match std::fs::read_to_string(&path) {
        Ok(content) => content.trim().to_owned(),
        Err(_) => String::new(),
    }
}

/// Overwrite the current-episode marker.
pub fn set_current_episode(data_dir: &DataDir, episode_id: &str) -> Result<()> {
    data_dir
        .ensure_exists()
        .with_context(|| format!("failed to create {}", data_dir.root().display()))?;
    std::fs::write(data_dir.current_episode_file(), episode_id)
        .context("failed to write current_episode")?;
    Ok(())
}

/// End the current episode, clear the marker, and log `EPISODE_END`.
/// Returns the ended id, or empty when no episode was current.
pub async fn end_episode(pool: &SqlitePool, data_dir: &DataDir) -> Result<String> {
    let episode_id = current_episode(data_dir);
    if episode_id.is_empty() {
        return Ok(String::new());
    }
    episodes_db::end_episode(pool, &episode_id, &now_ts()).await?;

    let marker = data_dir.current_episode_file();
    if marker.exists() {
        std::fs::remove_file(&marker).context("failed to remove current_episode")?;
    }

    EventLog::new(data_dir).append(
        EventKind::EpisodeEnd,
        "",
        serde_json::json!({ "episode_id": &episode_id }),
    )?;

    Ok(episode_id)
}
