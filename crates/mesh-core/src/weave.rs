//! Provenance weave: the second, in-store hash-chained ledger.
//!
//! Unlike the event log, weave records live in the store so that
//! `sequence_id` allocation is serialized with the row insert. A weave
//! append is one receipt; every state transition and spawn finalization
//! emits exactly one.

use anyhow::{Context, Result};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};

use mesh_db::config::DataDir;
use mesh_db::models::{WeaveEvent, new_id, now_ts};
use mesh_db::queries::weave as weave_db;
use mesh_db::retry::with_busy_retry;
use mesh_db::tx;

use crate::canon::{GENESIS_HASH, hash_without_event_hash};
use crate::episode;

/// Inputs for one weave append. Unset fields default to empty, and a `None`
/// episode is auto-tagged with the data directory's current episode.
#[derive(Debug, Clone, Default)]
pub struct WeaveParams {
    pub capsule_id: String,
    pub git_commit_sha: String,
    pub git_patch_hash: String,
    pub affected_symbols: Vec<String>,
    pub trace_id: String,
    pub parent_event_id: String,
    pub episode_id: Option<String>,
}

/// Append a weave record in its own immediate transaction, retrying on
/// store contention.
pub async fn append_weave(
    pool: &SqlitePool,
    data_dir: &DataDir,
    params: WeaveParams,
) -> Result<WeaveEvent> {
    let episode_id = match &params.episode_id {
        Some(ep) => ep.clone(),
        None => episode::current_episode(data_dir),
    };

    with_busy_retry(|| {
        let params = params.clone();
        let episode_id = episode_id.clone();
        async move {
            tx::immediate(pool, move |conn| {
                let params = params.clone();
                let episode_id = episode_id.clone();
                Box::pin(async move { append_on_conn(conn, params, episode_id).await })
            })
            .await
        }
    })
    .await
}

/// Append a weave record on a connection that already holds the write
/// lock. Used by the task machine so the receipt commits atomically with
/// the state update it witnesses.
pub async fn append_on_conn(
    conn: &mut SqliteConnection,
    params: WeaveParams,
    episode_id: String,
) -> Result<WeaveEvent> {
    let (prev_sequence_id, prev_hash) = match weave_db::last_chain_state(&mut *conn).await? {
        Some((seq, hash)) => (seq, hash),
        None => (0, GENESIS_HASH.to_owned()),
    };

    let mut event = WeaveEvent {
        event_id: new_id("weave"),
        sequence_id: prev_sequence_id + 1,
        episode_id,
        prev_hash,
        capsule_id: params.capsule_id,
        git_commit_sha: params.git_commit_sha,
        git_patch_hash: params.git_patch_hash,
        affected_symbols: Json(params.affected_symbols),
        trace_id: params.trace_id,
        parent_event_id: params.parent_event_id,
        event_hash: String::new(),
        created_at: now_ts(),
    };
    let value = serde_json::to_value(&event).context("failed to serialize weave event")?;
    event.event_hash = hash_without_event_hash(&value);

    weave_db::insert_weave_event(&mut *conn, &event).await?;
    Ok(event)
}

/// Verify the weave: gap-free sequence ids, prev-hash linkage from genesis,
/// and hash recomputation. Returns `(true, "")` or `(false, reason)`.
pub async fn verify_weave(pool: &SqlitePool) -> Result<(bool, String)> {
    let events = weave_db::list_weave_events(pool, None).await?;
    let mut prev_hash = GENESIS_HASH.to_owned();
    let mut expected_seq = 1i64;

    for event in &events {
        if event.sequence_id != expected_seq {
            return Ok((
                false,
                format!(
                    "sequence break at {}: expected sequence_id {expected_seq}, got {}",
                    event.event_id, event.sequence_id
                ),
            ));
        }
        if event.prev_hash != prev_hash {
            return Ok((
                false,
                format!(
                    "chain break at {}: expected prev_hash {prev_hash}, got {}",
                    event.event_id, event.prev_hash
                ),
            ));
        }
        let value = serde_json::to_value(event).context("failed to serialize weave event")?;
        let computed = hash_without_event_hash(&value);
        if event.event_hash != computed {
            return Ok((
                false,
                format!(
                    "hash mismatch at {}: stored={} computed={computed}",
                    event.event_id, event.event_hash
                ),
            ));
        }
        prev_hash = event.event_hash.clone();
        expected_seq += 1;
    }

    Ok((true, String::new()))
}
