//! Orchestrator control primitives built on typed `LOCK:` claims.
//!
//! Freeze, merge locking, and the orchestrator lease are all ordinary
//! claims on well-known lock resources, so they inherit the arbiter's
//! atomicity, TTLs, and observability for free. The spawner checks
//! [`is_frozen`] before launching anything.

use anyhow::Result;
use sqlx::SqlitePool;

use mesh_db::config::DataDir;
use mesh_db::models::{Agent, Claim, ClaimIntent};
use mesh_db::queries::agents as agents_db;

use crate::arbiter::{self, ClaimRequest};

/// Lock resource names.
pub const LEASE_PATH: &str = "orchestration";
pub const FREEZE_PATH: &str = "orch_freeze";
pub const MERGE_LOCK_PATH: &str = "orch_lock_merges";

const DEFAULT_LEASE_TTL_S: i64 = 300;
/// Control locks are held until explicitly cleared.
const CONTROL_TTL_S: i64 = 7 * 24 * 60 * 60;

/// Build a unique controller owner id.
pub fn make_owner(agent_hint: &str) -> String {
    let hint = if agent_hint.is_empty() {
        "orchestrator"
    } else {
        agent_hint
    };
    let hint = hint.replace(' ', "_");
    format!(
        "orchctl_{hint}_{}_{}",
        std::process::id(),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

async fn ensure_owner_agent(pool: &SqlitePool, owner: &str) -> Result<()> {
    if agents_db::get_agent(pool, owner).await?.is_none() {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        agents_db::register_agent(pool, &Agent::new(owner, cwd)).await?;
    }
    Ok(())
}

fn lock_resource(path: &str) -> String {
    format!("LOCK:{path}")
}

/// Acquire the orchestrator lease for `owner`.
pub async fn acquire_lease(
    pool: &SqlitePool,
    data_dir: &DataDir,
    owner: &str,
    ttl_s: Option<i64>,
    force: bool,
) -> Result<(bool, Claim, Vec<Claim>)> {
    ensure_owner_agent(pool, owner).await?;
    let outcome = arbiter::make_claim(
        pool,
        data_dir,
        &ClaimRequest {
            agent_id: owner.to_owned(),
            resource: lock_resource(LEASE_PATH),
            intent: ClaimIntent::Edit,
            ttl_s: ttl_s.unwrap_or(DEFAULT_LEASE_TTL_S),
            priority: arbiter::DEFAULT_PRIORITY,
            force,
            reason: "orchestrator lease".to_owned(),
        },
    )
    .await?;
    Ok((outcome.granted, outcome.claim, outcome.conflicts))
}

/// Renew the lease: the holder re-claims with a fresh TTL.
pub async fn renew_lease(
    pool: &SqlitePool,
    data_dir: &DataDir,
    owner: &str,
    ttl_s: Option<i64>,
) -> Result<(bool, Claim, Vec<Claim>)> {
    acquire_lease(pool, data_dir, owner, ttl_s, false).await
}

/// Release the lease held by `owner`. Returns the count released.
pub async fn release_lease(pool: &SqlitePool, data_dir: &DataDir, owner: &str) -> Result<u64> {
    arbiter::release(
        pool,
        data_dir,
        owner,
        Some(&lock_resource(LEASE_PATH)),
        false,
    )
    .await
}

/// Current lease holders (normally zero or one).
pub async fn lease_holders(pool: &SqlitePool) -> Result<Vec<Claim>> {
    arbiter::check(pool, &lock_resource(LEASE_PATH), None).await
}

async fn force_clear_resource(pool: &SqlitePool, data_dir: &DataDir, path: &str) -> Result<u64> {
    let sweeper = make_owner("sweeper");
    ensure_owner_agent(pool, &sweeper).await?;
    arbiter::make_claim(
        pool,
        data_dir,
        &ClaimRequest {
            agent_id: sweeper.clone(),
            resource: lock_resource(path),
            intent: ClaimIntent::Edit,
            ttl_s: 5,
            priority: arbiter::DEFAULT_PRIORITY,
            force: true,
            reason: "force clear resource".to_owned(),
        },
    )
    .await?;
    arbiter::release(pool, data_dir, &sweeper, Some(&lock_resource(path)), false).await
}

/// Force-clear the lease regardless of holder.
pub async fn clear_lease(pool: &SqlitePool, data_dir: &DataDir) -> Result<u64> {
    force_clear_resource(pool, data_dir, LEASE_PATH).await
}

/// Enable or disable the orchestrator freeze.
pub async fn set_frozen(
    pool: &SqlitePool,
    data_dir: &DataDir,
    enabled: bool,
    owner: &str,
    reason: &str,
) -> Result<()> {
    if enabled {
        ensure_owner_agent(pool, owner).await?;
        arbiter::make_claim(
            pool,
            data_dir,
            &ClaimRequest {
                agent_id: owner.to_owned(),
                resource: lock_resource(FREEZE_PATH),
                intent: ClaimIntent::Edit,
                ttl_s: CONTROL_TTL_S,
                priority: arbiter::DEFAULT_PRIORITY,
                force: true,
                reason: if reason.is_empty() {
                    "orchestrator freeze".to_owned()
                } else {
                    reason.to_owned()
                },
            },
        )
        .await?;
        return Ok(());
    }
    force_clear_resource(pool, data_dir, FREEZE_PATH).await?;
    Ok(())
}

/// Whether new spawns are blocked.
pub async fn is_frozen(pool: &SqlitePool) -> Result<bool> {
    Ok(!arbiter::check(pool, &lock_resource(FREEZE_PATH), None)
        .await?
        .is_empty())
}

/// Enable or disable the merge lock.
pub async fn set_merges_locked(
    pool: &SqlitePool,
    data_dir: &DataDir,
    enabled: bool,
    owner: &str,
    reason: &str,
) -> Result<()> {
    if enabled {
        ensure_owner_agent(pool, owner).await?;
        arbiter::make_claim(
            pool,
            data_dir,
            &ClaimRequest {
                agent_id: owner.to_owned(),
                resource: lock_resource(MERGE_LOCK_PATH),
                intent: ClaimIntent::Edit,
                ttl_s: CONTROL_TTL_S,
                priority: arbiter::DEFAULT_PRIORITY,
                force: true,
                reason: if reason.is_empty() {
                    "merge lock enabled".to_owned()
                } else {
                    reason.to_owned()
                },
            },
        )
        .await?;
        return Ok(());
    }
    force_clear_resource(pool, data_dir, MERGE_LOCK_PATH).await?;
    Ok(())
}

/// Whether merges are locked.
pub async fn is_merges_locked(pool: &SqlitePool) -> Result<bool> {
    Ok(!arbiter::check(pool, &lock_resource(MERGE_LOCK_PATH), None)
        .await?
        .is_empty())
}
