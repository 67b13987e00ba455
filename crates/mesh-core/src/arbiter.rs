//! Claim arbiter: exclusive-intent resource claims, waiters with priority
//! inheritance, and stale-holder preemption.
//!
//! Resources are named with a `TYPE:value` grammar (`PORT:3000`,
//! `LOCK:npm`, `TEST_SUITE:integration`, `TEMP_DIR:/tmp/x`); anything else
//! is a file path, made absolute and normalized before comparison so that
//! `PORT:3000` and `FILE:/tmp/3000` can never collide.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use sqlx::SqlitePool;

use mesh_db::config::DataDir;
use mesh_db::models::{
    Claim, ClaimIntent, ClaimState, EventKind, ResourceType, Waiter, new_id, now_plus_secs, now_ts,
};
use mesh_db::queries::claims as claims_db;
use mesh_db::queries::waiters as waiters_db;
use mesh_db::retry::with_busy_retry;

use crate::episode;
use crate::eventlog::EventLog;

/// Default claim TTL: 30 minutes.
pub const DEFAULT_TTL_S: i64 = 1800;

/// Default claim priority.
pub const DEFAULT_PRIORITY: i64 = 5;

/// A parsed resource: type plus its normalized identifying path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub path: String,
}

impl Resource {
    /// Parse the `TYPE:value` grammar; bare values are file paths.
    pub fn parse(raw: &str) -> Self {
        for (prefix, resource_type) in [
            ("PORT:", ResourceType::Port),
            ("LOCK:", ResourceType::Lock),
            ("TEST_SUITE:", ResourceType::TestSuite),
            ("TEMP_DIR:", ResourceType::TempDir),
            ("FILE:", ResourceType::File),
        ] {
            if let Some(value) = raw.strip_prefix(prefix) {
                let path = if resource_type == ResourceType::File {
                    normalize_path(value)
                } else {
                    value.to_owned()
                };
                return Self {
                    resource_type,
                    path,
                };
            }
        }
        Self {
            resource_type: ResourceType::File,
            path: normalize_path(raw),
        }
    }
}

/// Make a file path absolute and lexically normalized. Unlike
/// canonicalization this works for paths that do not exist yet.
pub fn normalize_path(path: &str) -> String {
    let p = Path::new(path);
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(p)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized.to_string_lossy().into_owned()
}

/// Inputs for one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub agent_id: String,
    pub resource: String,
    pub intent: ClaimIntent,
    pub ttl_s: i64,
    pub priority: i64,
    pub force: bool,
    pub reason: String,
}

impl ClaimRequest {
    /// An edit claim with default TTL and priority.
    pub fn edit(agent_id: &str, resource: &str) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            resource: resource.to_owned(),
            intent: ClaimIntent::Edit,
            ttl_s: DEFAULT_TTL_S,
            priority: DEFAULT_PRIORITY,
            force: false,
            reason: String::new(),
        }
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub granted: bool,
    pub claim: Claim,
    pub conflicts: Vec<Claim>,
}

/// Attempt a claim with collision detection. Conflicts are data, not an
/// error: `granted = false` carries the blocking claims back to the
/// caller. A granted claim logs a `CLAIM` event.
pub async fn make_claim(
    pool: &SqlitePool,
    data_dir: &DataDir,
    request: &ClaimRequest,
) -> Result<ClaimOutcome> {
    let resource = Resource::parse(&request.resource);
    let claim = Claim {
        claim_id: new_id("clm"),
        agent_id: request.agent_id.clone(),
        resource_type: resource.resource_type,
        path: resource.path,
        intent: request.intent,
        state: ClaimState::Active,
        ttl_s: request.ttl_s,
        created_at: now_ts(),
        expires_at: now_plus_secs(request.ttl_s),
        released_at: String::new(),
        reason: request.reason.clone(),
        episode_id: episode::current_episode(data_dir),
        priority: request.priority,
        effective_priority: request.priority,
    };

    let (granted, conflicts) =
        with_busy_retry(|| claims_db::check_and_claim(pool, &claim, request.force)).await?;

    if granted {
        EventLog::new(data_dir).append(
            EventKind::Claim,
            &request.agent_id,
            serde_json::json!({
                "claim_id": &claim.claim_id,
                "resource_type": claim.resource_type,
                "path": &claim.path,
                "intent": claim.intent,
                "ttl_s": claim.ttl_s,
                "force": request.force,
            }),
        )?;
    }

    Ok(ClaimOutcome {
        granted,
        claim,
        conflicts,
    })
}

/// Release an agent's claims on one resource, or all of them. Waiters on a
/// released resource are consumed. Returns the count released.
pub async fn release(
    pool: &SqlitePool,
    data_dir: &DataDir,
    agent_id: &str,
    resource: Option<&str>,
    release_all: bool,
) -> Result<u64> {
    let parsed = resource.map(Resource::parse);
    let (resource_type, path) = match &parsed {
        Some(r) => (r.resource_type, Some(r.path.as_str())),
        None => (ResourceType::File, None),
    };

    let count = with_busy_retry(|| {
        claims_db::release_claim(pool, agent_id, resource_type, path, release_all)
    })
    .await?;

    if let Some(r) = &parsed {
        waiters_db::clear_waiters(pool, r.resource_type, &r.path).await?;
    }

    if count > 0 {
        EventLog::new(data_dir).append(
            EventKind::Release,
            agent_id,
            serde_json::json!({
                "path": path,
                "all": release_all,
                "count": count,
            }),
        )?;
    }

    Ok(count)
}

/// Active edit claims on a resource, after expiring stale rows.
pub async fn check(
    pool: &SqlitePool,
    resource: &str,
    exclude_agent: Option<&str>,
) -> Result<Vec<Claim>> {
    let parsed = Resource::parse(resource);
    claims_db::expire_stale_claims(pool).await?;
    claims_db::check_collision(pool, parsed.resource_type, &parsed.path, exclude_agent).await
}

/// Expire every lapsed claim and log one `EXPIRE` event when any were.
pub async fn expire_stale(pool: &SqlitePool, data_dir: &DataDir) -> Result<u64> {
    let count = claims_db::expire_stale_claims(pool).await?;
    if count > 0 {
        EventLog::new(data_dir).append(
            EventKind::Expire,
            "",
            serde_json::json!({ "expired": count }),
        )?;
    }
    Ok(count)
}

/// Record a waiter on a resource and recompute the holder's effective
/// priority: `max(holder.priority, max(waiter priorities))`. Inheritance
/// is advisory; it blocks nothing.
pub async fn register_wait(
    pool: &SqlitePool,
    data_dir: &DataDir,
    agent_id: &str,
    resource: &str,
    priority: i64,
    reason: &str,
) -> Result<Waiter> {
    let parsed = Resource::parse(resource);
    let waiter = Waiter {
        waiter_id: new_id("wait"),
        resource_type: parsed.resource_type,
        path: parsed.path.clone(),
        waiter_agent_id: agent_id.to_owned(),
        episode_id: episode::current_episode(data_dir),
        priority,
        reason: reason.to_owned(),
        created_at: now_ts(),
    };
    waiters_db::add_waiter(pool, &waiter).await?;

    apply_priority_inheritance(pool, &parsed).await?;

    EventLog::new(data_dir).append(
        EventKind::Wait,
        agent_id,
        serde_json::json!({
            "waiter_id": &waiter.waiter_id,
            "resource_type": waiter.resource_type,
            "path": &waiter.path,
            "priority": priority,
        }),
    )?;

    Ok(waiter)
}

async fn apply_priority_inheritance(pool: &SqlitePool, resource: &Resource) -> Result<()> {
    let holders =
        claims_db::check_collision(pool, resource.resource_type, &resource.path, None).await?;
    let Some(holder) = holders.first() else {
        return Ok(());
    };

    let waiters = waiters_db::list_waiters(pool, resource.resource_type, &resource.path).await?;
    let Some(max_waiter_priority) = waiters.iter().map(|w| w.priority).max() else {
        return Ok(());
    };

    let new_effective = holder.priority.max(max_waiter_priority);
    if new_effective != holder.effective_priority {
        claims_db::update_effective_priority(pool, &holder.claim_id, new_effective).await?;
        tracing::debug!(
            claim_id = %holder.claim_id,
            effective_priority = new_effective,
            "priority inherited from waiter"
        );
    }
    Ok(())
}

/// Attempt stale-holder preemption. Succeeds only when the holder's TTL
/// lapsed or its heartbeat is older than `stale_threshold_s`; a live
/// holder is never stolen from. Logs a `STEAL` event on success.
pub async fn steal(
    pool: &SqlitePool,
    data_dir: &DataDir,
    agent_id: &str,
    resource: &str,
    stale_threshold_s: i64,
    priority: i64,
    reason: &str,
) -> Result<(bool, String)> {
    let parsed = Resource::parse(resource);
    let new_claim = Claim {
        claim_id: new_id("clm"),
        agent_id: agent_id.to_owned(),
        resource_type: parsed.resource_type,
        path: parsed.path.clone(),
        intent: ClaimIntent::Edit,
        state: ClaimState::Active,
        ttl_s: DEFAULT_TTL_S,
        created_at: now_ts(),
        expires_at: now_plus_secs(DEFAULT_TTL_S),
        released_at: String::new(),
        reason: reason.to_owned(),
        episode_id: episode::current_episode(data_dir),
        priority,
        effective_priority: priority,
    };

    let outcome =
        with_busy_retry(|| claims_db::steal_claim(pool, &new_claim, stale_threshold_s)).await?;

    if outcome.ok {
        EventLog::new(data_dir).append(
            EventKind::Steal,
            agent_id,
            serde_json::json!({
                "claim_id": &new_claim.claim_id,
                "resource_type": new_claim.resource_type,
                "path": &new_claim.path,
                "steal_reason": &outcome.reason,
            }),
        )?;
    }

    Ok((outcome.ok, outcome.reason))
}
