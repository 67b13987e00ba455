//! Claim, release, wait, and steal commands.

use clap::Args;
use sqlx::SqlitePool;

use mesh_core::arbiter::{self, ClaimRequest};
use mesh_db::config::DataDir;
use mesh_db::models::{Claim, ClaimIntent};

use crate::exit;

#[derive(Args)]
pub struct ClaimArgs {
    pub agent_id: String,
    /// Resource: a file path or TYPE:value (PORT:3000, LOCK:npm, ...)
    pub resource: String,
    #[arg(long, default_value = "edit")]
    pub intent: String,
    #[arg(long, default_value_t = arbiter::DEFAULT_TTL_S)]
    pub ttl: i64,
    #[arg(long, default_value_t = arbiter::DEFAULT_PRIORITY)]
    pub priority: i64,
    /// Expire conflicting claims instead of failing
    #[arg(long)]
    pub force: bool,
    #[arg(long, default_value = "")]
    pub reason: String,
}

fn print_conflicts(conflicts: &[Claim]) {
    for claim in conflicts {
        println!(
            "  CONFLICT: {} claimed by {} (intent={}, expires={})",
            claim.path, claim.agent_id, claim.intent, claim.expires_at
        );
    }
}

pub async fn claim(pool: &SqlitePool, data_dir: &DataDir, args: ClaimArgs) -> anyhow::Result<u8> {
    let intent: ClaimIntent = match args.intent.parse() {
        Ok(intent) => intent,
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit::USAGE);
        }
    };

    let outcome = arbiter::make_claim(
        pool,
        data_dir,
        &ClaimRequest {
            agent_id: args.agent_id,
            resource: args.resource,
            intent,
            ttl_s: args.ttl,
            priority: args.priority,
            force: args.force,
            reason: args.reason,
        },
    )
    .await?;

    if !outcome.granted {
        println!("claim denied:");
        print_conflicts(&outcome.conflicts);
        return Ok(exit::FAILURE);
    }
    println!(
        "granted {} on {} (expires {})",
        outcome.claim.claim_id, outcome.claim.path, outcome.claim.expires_at
    );
    if !outcome.conflicts.is_empty() {
        println!("preempted:");
        print_conflicts(&outcome.conflicts);
    }
    Ok(exit::OK)
}

#[derive(Args)]
pub struct ReleaseArgs {
    pub agent_id: String,
    #[arg(long)]
    pub resource: Option<String>,
    /// Release every active claim the agent holds
    #[arg(long)]
    pub all: bool,
}

pub async fn release(
    pool: &SqlitePool,
    data_dir: &DataDir,
    args: ReleaseArgs,
) -> anyhow::Result<u8> {
    if args.resource.is_none() && !args.all {
        eprintln!("either --resource or --all is required");
        return Ok(exit::USAGE);
    }
    let count = arbiter::release(
        pool,
        data_dir,
        &args.agent_id,
        args.resource.as_deref(),
        args.all,
    )
    .await?;
    println!("released {count}");
    Ok(exit::OK)
}

pub async fn check(
    pool: &SqlitePool,
    resource: &str,
    exclude_agent: Option<&str>,
) -> anyhow::Result<u8> {
    let conflicts = arbiter::check(pool, resource, exclude_agent).await?;
    if conflicts.is_empty() {
        println!("no active edit claims");
        return Ok(exit::OK);
    }
    print_conflicts(&conflicts);
    Ok(exit::FAILURE)
}

#[derive(Args)]
pub struct WaitArgs {
    pub agent_id: String,
    pub resource: String,
    #[arg(long, default_value_t = arbiter::DEFAULT_PRIORITY)]
    pub priority: i64,
    #[arg(long, default_value = "")]
    pub reason: String,
}

pub async fn wait(pool: &SqlitePool, data_dir: &DataDir, args: WaitArgs) -> anyhow::Result<u8> {
    let waiter = arbiter::register_wait(
        pool,
        data_dir,
        &args.agent_id,
        &args.resource,
        args.priority,
        &args.reason,
    )
    .await?;
    println!("waiting as {} on {}", waiter.waiter_id, waiter.path);
    Ok(exit::OK)
}

#[derive(Args)]
pub struct StealArgs {
    pub agent_id: String,
    pub resource: String,
    #[arg(long, default_value_t = 300)]
    pub stale_threshold: i64,
    #[arg(long, default_value_t = arbiter::DEFAULT_PRIORITY)]
    pub priority: i64,
    #[arg(long, default_value = "")]
    pub reason: String,
}

pub async fn steal(pool: &SqlitePool, data_dir: &DataDir, args: StealArgs) -> anyhow::Result<u8> {
    let (ok, reason) = arbiter::steal(
        pool,
        data_dir,
        &args.agent_id,
        &args.resource,
        args.stale_threshold,
        args.priority,
        &args.reason,
    )
    .await?;
    if ok {
        println!("stolen ({reason})");
        Ok(exit::OK)
    } else {
        println!("steal refused: {reason}");
        Ok(exit::FAILURE)
    }
}
