//! Query functions for the `claims` table.
//!
//! `check_and_claim` and `steal_claim` are the only places that decide who
//! holds an edit claim; both run as single transactions so the
//! one-active-edit-per-resource invariant holds under concurrent callers.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Claim, ClaimState, ResourceType, now_minus_secs, now_ts};

/// Insert a claim row as-is. Callers that need collision checking use
/// [`check_and_claim`] instead.
pub async fn create_claim(pool: &SqlitePool, claim: &Claim) -> Result<()> {
    sqlx::query(
        "INSERT INTO claims \
         (claim_id, agent_id, resource_type, path, intent, state, ttl_s, \
          created_at, expires_at, released_at, reason, episode_id, priority, effective_priority) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&claim.claim_id)
    .bind(claim.agent_id.as_str())
    .bind(claim.resource_type)
    .bind(&claim.path)
    .bind(claim.intent)
    .bind(claim.state)
    .bind(claim.ttl_s)
    .bind(&claim.created_at)
    .bind(&claim.expires_at)
    .bind(&claim.released_at)
    .bind(&claim.reason)
    .bind(&claim.episode_id)
    .bind(claim.priority)
    .bind(claim.effective_priority)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert claim {}", claim.claim_id))?;

    Ok(())
}

/// Active edit claims on `(resource_type, path)`, optionally excluding one
/// agent's own claims.
pub async fn check_collision(
    pool: &SqlitePool,
    resource_type: ResourceType,
    path: &str,
    exclude_agent: Option<&str>,
) -> Result<Vec<Claim>> {
    let claims = match exclude_agent {
        Some(agent) => {
            sqlx::query_as::<_, Claim>(
                "SELECT * FROM claims WHERE path = ? AND resource_type = ? \
                 AND state = 'active' AND intent = 'edit' AND agent_id != ?",
            )
            .bind(path)
            .bind(resource_type)
            .bind(agent)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Claim>(
                "SELECT * FROM claims WHERE path = ? AND resource_type = ? \
                 AND state = 'active' AND intent = 'edit'",
            )
            .bind(path)
            .bind(resource_type)
            .fetch_all(pool)
            .await
        }
    }
    .with_context(|| format!("failed to check collisions on {path}"))?;

    Ok(claims)
}

/// Atomic collision check + claim insert. Returns `(granted, conflicts)`.
///
/// In one transaction: expire stale actives, scan for edit-vs-edit
/// conflicts by other agents, then either bail (conflicts, no force) or
/// expire the conflicts (force), release the caller's own prior claim on
/// the resource, and insert the candidate.
pub async fn check_and_claim(
    pool: &SqlitePool,
    claim: &Claim,
    force: bool,
) -> Result<(bool, Vec<Claim>)> {
    let mut tx = pool.begin().await.context("failed to begin claim txn")?;
    let now = now_ts();

    sqlx::query("UPDATE claims SET state = 'expired' WHERE state = 'active' AND expires_at < ?")
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("failed to expire stale claims")?;

    let mut conflicts = Vec::new();
    if claim.intent == crate::models::ClaimIntent::Edit {
        conflicts = sqlx::query_as::<_, Claim>(
            "SELECT * FROM claims WHERE path = ? AND resource_type = ? \
             AND state = 'active' AND intent = 'edit' AND agent_id != ?",
        )
        .bind(&claim.path)
        .bind(claim.resource_type)
        .bind(&claim.agent_id)
        .fetch_all(&mut *tx)
        .await
        .context("failed to scan for conflicting claims")?;
    }

    if !conflicts.is_empty() && !force {
        tx.rollback().await.ok();
        return Ok((false, conflicts));
    }

    if !conflicts.is_empty() && force {
        sqlx::query(
            "UPDATE claims SET state = 'expired' \
             WHERE path = ? AND resource_type = ? AND state = 'active' \
             AND intent = 'edit' AND agent_id != ?",
        )
        .bind(&claim.path)
        .bind(claim.resource_type)
        .bind(&claim.agent_id)
        .execute(&mut *tx)
        .await
        .context("failed to force-expire conflicting claims")?;
    }

    // Re-claiming a resource supersedes the caller's own prior claim.
    sqlx::query(
        "UPDATE claims SET state = 'released', released_at = ? \
         WHERE agent_id = ? AND path = ? AND resource_type = ? AND state = 'active'",
    )
    .bind(&now)
    .bind(&claim.agent_id)
    .bind(&claim.path)
    .bind(claim.resource_type)
    .execute(&mut *tx)
    .await
    .context("failed to release prior claim")?;

    sqlx::query(
        "INSERT INTO claims \
         (claim_id, agent_id, resource_type, path, intent, state, ttl_s, \
          created_at, expires_at, released_at, reason, episode_id, priority, effective_priority) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&claim.claim_id)
    .bind(&claim.agent_id)
    .bind(claim.resource_type)
    .bind(&claim.path)
    .bind(claim.intent)
    .bind(claim.state)
    .bind(claim.ttl_s)
    .bind(&claim.created_at)
    .bind(&claim.expires_at)
    .bind(&claim.released_at)
    .bind(&claim.reason)
    .bind(&claim.episode_id)
    .bind(claim.priority)
    .bind(claim.effective_priority)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("failed to insert claim {}", claim.claim_id))?;

    tx.commit().await.context("failed to commit claim txn")?;
    Ok((true, conflicts))
}

/// Release claims held by an agent. `path: None` with `release_all` sweeps
/// every active claim the agent holds. Returns the count released.
pub async fn release_claim(
    pool: &SqlitePool,
    agent_id: &str,
    resource_type: ResourceType,
    path: Option<&str>,
    release_all: bool,
) -> Result<u64> {
    let now = now_ts();
    let result = if release_all {
        sqlx::query(
            "UPDATE claims SET state = 'released', released_at = ? \
             WHERE agent_id = ? AND state = 'active'",
        )
        .bind(&now)
        .bind(agent_id)
        .execute(pool)
        .await
    } else if let Some(path) = path {
        sqlx::query(
            "UPDATE claims SET state = 'released', released_at = ? \
             WHERE agent_id = ? AND path = ? AND resource_type = ? AND state = 'active'",
        )
        .bind(&now)
        .bind(agent_id)
        .bind(path)
        .bind(resource_type)
        .execute(pool)
        .await
    } else {
        return Ok(0);
    }
    .with_context(|| format!("failed to release claims for {agent_id}"))?;

    Ok(result.rows_affected())
}

/// List claims, optionally filtered by agent and/or restricted to active.
pub async fn list_claims(
    pool: &SqlitePool,
    agent_id: Option<&str>,
    active_only: bool,
) -> Result<Vec<Claim>> {
    let mut query = String::from("SELECT * FROM claims");
    let mut conditions = Vec::new();
    if active_only {
        conditions.push("state = 'active'".to_owned());
    }
    if agent_id.is_some() {
        conditions.push("agent_id = ?".to_owned());
    }
    if !conditions.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }
    query.push_str(" ORDER BY created_at");

    let mut q = sqlx::query_as::<_, Claim>(&query);
    if let Some(agent) = agent_id {
        q = q.bind(agent);
    }
    let claims = q.fetch_all(pool).await.context("failed to list claims")?;

    Ok(claims)
}

/// Expire every active claim whose TTL has lapsed. Returns the count.
pub async fn expire_stale_claims(pool: &SqlitePool) -> Result<u64> {
    let now = now_ts();
    let result = sqlx::query(
        "UPDATE claims SET state = 'expired' WHERE state = 'active' AND expires_at < ?",
    )
    .bind(&now)
    .execute(pool)
    .await
    .context("failed to expire stale claims")?;

    Ok(result.rows_affected())
}

/// Rewrite a claim's effective priority (priority inheritance).
pub async fn update_effective_priority(
    pool: &SqlitePool,
    claim_id: &str,
    effective_priority: i64,
) -> Result<()> {
    sqlx::query("UPDATE claims SET effective_priority = ? WHERE claim_id = ?")
        .bind(effective_priority)
        .bind(claim_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to update effective priority on {claim_id}"))?;

    Ok(())
}

/// Outcome of a steal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealOutcome {
    pub ok: bool,
    pub reason: String,
}

/// Attempt to take over a stale holder's claim, atomically.
///
/// Succeeds only when the current holder's TTL has lapsed
/// (`ttl_expired`), its agent's heartbeat is older than
/// `stale_threshold_s` (`heartbeat_stale`), or nobody holds the resource
/// at all (`no_active_holder`). A live holder yields `still active` and
/// no writes.
pub async fn steal_claim(
    pool: &SqlitePool,
    new_claim: &Claim,
    stale_threshold_s: i64,
) -> Result<StealOutcome> {
    let mut tx = pool.begin().await.context("failed to begin steal txn")?;
    let now = now_ts();

    let holders = sqlx::query_as::<_, Claim>(
        "SELECT * FROM claims WHERE path = ? AND resource_type = ? \
         AND state = 'active' AND intent = 'edit' AND agent_id != ?",
    )
    .bind(&new_claim.path)
    .bind(new_claim.resource_type)
    .bind(&new_claim.agent_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to read current holder")?;

    let reason = if holders.is_empty() {
        "no_active_holder".to_owned()
    } else {
        let holder = &holders[0];
        if holder.expires_at < now {
            "ttl_expired".to_owned()
        } else {
            let heartbeat: Option<(String,)> =
                sqlx::query_as("SELECT last_heartbeat FROM agents WHERE agent_id = ?")
                    .bind(&holder.agent_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("failed to read holder heartbeat")?;
            let cutoff = now_minus_secs(stale_threshold_s);
            match heartbeat {
                Some((hb,)) if hb < cutoff => "heartbeat_stale".to_owned(),
                // No agent row counts as stale: the holder is unreachable.
                None => "heartbeat_stale".to_owned(),
                Some(_) => {
                    tx.rollback().await.ok();
                    return Ok(StealOutcome {
                        ok: false,
                        reason: "still active".to_owned(),
                    });
                }
            }
        }
    };

    sqlx::query(
        "UPDATE claims SET state = 'expired' \
         WHERE path = ? AND resource_type = ? AND state = 'active' \
         AND intent = 'edit' AND agent_id != ?",
    )
    .bind(&new_claim.path)
    .bind(new_claim.resource_type)
    .bind(&new_claim.agent_id)
    .execute(&mut *tx)
    .await
    .context("failed to expire stolen claim")?;

    sqlx::query(
        "UPDATE claims SET state = 'released', released_at = ? \
         WHERE agent_id = ? AND path = ? AND resource_type = ? AND state = 'active'",
    )
    .bind(&now)
    .bind(&new_claim.agent_id)
    .bind(&new_claim.path)
    .bind(new_claim.resource_type)
    .execute(&mut *tx)
    .await
    .context("failed to release stealer's prior claim")?;

    sqlx::query(
        "INSERT INTO claims \
         (claim_id, agent_id, resource_type, path, intent, state, ttl_s, \
          created_at, expires_at, released_at, reason, episode_id, priority, effective_priority) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&new_claim.claim_id)
    .bind(&new_claim.agent_id)
    .bind(new_claim.resource_type)
    .bind(&new_claim.path)
    .bind(new_claim.intent)
    .bind(ClaimState::Active)
    .bind(new_claim.ttl_s)
    .bind(&new_claim.created_at)
    .bind(&new_claim.expires_at)
    .bind(&new_claim.released_at)
    .bind(&new_claim.reason)
    .bind(&new_claim.episode_id)
    .bind(new_claim.priority)
    .bind(new_claim.effective_priority)
    .execute(&mut *tx)
    .await
    .context("failed to insert stealing claim")?;

    tx.commit().await.context("failed to commit steal txn")?;
    Ok(StealOutcome { ok: true, reason })
}
