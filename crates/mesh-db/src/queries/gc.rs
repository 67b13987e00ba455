//! Retention GC for store rows.
//!
//! Independent from the event-log GC: the two retention windows are
//! separate knobs and need not be equal.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::now_minus_secs;

/// Counts of rows removed by one GC pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcCounts {
    pub claims: u64,
    pub agents: u64,
    pub waiters: u64,
}

impl GcCounts {
    /// Total rows removed.
    pub fn total(&self) -> u64 {
        self.claims + self.agents + self.waiters
    }
}

/// Delete settled claims, long-gone agents, and stale waiters older than
/// `max_age_hours`.
pub async fn gc_old_data(pool: &SqlitePool, max_age_hours: i64) -> Result<GcCounts> {
    let cutoff = now_minus_secs(max_age_hours * 3600);

    let claims = sqlx::query(
        "DELETE FROM claims WHERE state IN ('released','expired') AND created_at < ?",
    )
    .bind(&cutoff)
    .execute(pool)
    .await
    .context("failed to gc claims")?
    .rows_affected();

    let agents = sqlx::query("DELETE FROM agents WHERE status = 'gone' AND last_heartbeat < ?")
        .bind(&cutoff)
        .execute(pool)
        .await
        .context("failed to gc agents")?
        .rows_affected();

    let waiters = sqlx::query("DELETE FROM waiters WHERE created_at < ?")
        .bind(&cutoff)
        .execute(pool)
        .await
        .context("failed to gc waiters")?
        .rows_affected();

    Ok(GcCounts {
        claims,
        agents,
        waiters,
    })
}
