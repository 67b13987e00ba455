//! Episode, orchestrator-control, and commit commands.

use clap::{Args, Subcommand};
use sqlx::SqlitePool;

use mesh_core::eventlog::EventLog;
use mesh_core::gitbridge;
use mesh_core::weave::{self, WeaveParams};
use mesh_core::{control, episode};
use mesh_db::config::DataDir;
use mesh_db::models::EventKind;

use crate::exit;

#[derive(Subcommand)]
pub enum EpisodeCommands {
    /// Start a new episode and set it current
    Start {
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        parent: String,
    },
    /// End the current episode
    End,
    /// Print the current episode id
    Current,
}

pub async fn run_episode(
    pool: &SqlitePool,
    data_dir: &DataDir,
    command: EpisodeCommands,
) -> anyhow::Result<u8> {
    match command {
        EpisodeCommands::Start { title, parent } => {
            let episode_id = episode::start_episode(pool, data_dir, &title, &parent).await?;
            println!("{episode_id}");
            Ok(exit::OK)
        }
        EpisodeCommands::End => {
            let ended = episode::end_episode(pool, data_dir).await?;
            if ended.is_empty() {
                println!("no current episode");
            } else {
                println!("ended {ended}");
            }
            Ok(exit::OK)
        }
        EpisodeCommands::Current => {
            let current = episode::current_episode(data_dir);
            if current.is_empty() {
                println!("(none)");
            } else {
                println!("{current}");
            }
            Ok(exit::OK)
        }
    }
}

#[derive(Subcommand)]
pub enum OrchCommands {
    /// Block new spawns
    Freeze {
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Allow spawns again
    Thaw,
    /// Block merges
    LockMerges {
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Allow merges again
    UnlockMerges,
    /// Acquire or renew the orchestrator lease
    Lease {
        owner: String,
        #[arg(long)]
        ttl: Option<i64>,
        #[arg(long)]
        force: bool,
    },
    /// Release the orchestrator lease
    ReleaseLease { owner: String },
    /// Show control state
    Status,
}

pub async fn run_orch(
    pool: &SqlitePool,
    data_dir: &DataDir,
    command: OrchCommands,
) -> anyhow::Result<u8> {
    let log = EventLog::new(data_dir);
    match command {
        OrchCommands::Freeze { reason } => {
            let owner = control::make_owner("cli");
            control::set_frozen(pool, data_dir, true, &owner, &reason).await?;
            log.append(
                EventKind::OrchFreeze,
                &owner,
                serde_json::json!({ "enabled": true, "reason": reason }),
            )?;
            println!("frozen");
            Ok(exit::OK)
        }
        OrchCommands::Thaw => {
            let owner = control::make_owner("cli");
            control::set_frozen(pool, data_dir, false, &owner, "").await?;
            log.append(
                EventKind::OrchFreeze,
                &owner,
                serde_json::json!({ "enabled": false }),
            )?;
            println!("thawed");
            Ok(exit::OK)
        }
        OrchCommands::LockMerges { reason } => {
            let owner = control::make_owner("cli");
            control::set_merges_locked(pool, data_dir, true, &owner, &reason).await?;
            log.append(
                EventKind::OrchLockMerges,
                &owner,
                serde_json::json!({ "enabled": true, "reason": reason }),
            )?;
            println!("merges locked");
            Ok(exit::OK)
        }
        OrchCommands::UnlockMerges => {
            let owner = control::make_owner("cli");
            control::set_merges_locked(pool, data_dir, false, &owner, "").await?;
            log.append(
                EventKind::OrchLockMerges,
                &owner,
                serde_json::json!({ "enabled": false }),
            )?;
            println!("merges unlocked");
            Ok(exit::OK)
        }
        OrchCommands::Lease { owner, ttl, force } => {
            let (granted, claim, conflicts) =
                control::acquire_lease(pool, data_dir, &owner, ttl, force).await?;
            if !granted {
                for conflict in conflicts {
                    println!(
                        "lease held by {} until {}",
                        conflict.agent_id, conflict.expires_at
                    );
                }
                return Ok(exit::FAILURE);
            }
            log.append(
                EventKind::OrchLeaseRenew,
                &owner,
                serde_json::json!({ "claim_id": &claim.claim_id, "expires_at": &claim.expires_at }),
            )?;
            println!("lease granted until {}", claim.expires_at);
            Ok(exit::OK)
        }
        OrchCommands::ReleaseLease { owner } => {
            let count = control::release_lease(pool, data_dir, &owner).await?;
            println!("released {count}");
            Ok(exit::OK)
        }
        OrchCommands::Status => {
            println!("frozen: {}", control::is_frozen(pool).await?);
            println!("merges_locked: {}", control::is_merges_locked(pool).await?);
            for claim in control::lease_holders(pool).await? {
                println!("lease: {} until {}", claim.agent_id, claim.expires_at);
            }
            Ok(exit::OK)
        }
    }
}

#[derive(Args)]
pub struct CommitArgs {
    /// Commit message
    #[arg(short, long)]
    pub message: String,
    /// Agent recorded on the receipt
    #[arg(long, default_value = "")]
    pub agent: String,
    /// Test command to run before committing
    #[arg(long)]
    pub run_tests: Option<String>,
}

/// Commit staged changes with a provenance receipt: patch hash + stable
/// patch id flow into the weave, and a `COMMIT` event is logged.
pub async fn commit(
    pool: &SqlitePool,
    data_dir: &DataDir,
    args: CommitArgs,
) -> anyhow::Result<u8> {
    let cwd = std::env::current_dir()?;
    if !gitbridge::is_git_repo(&cwd) {
        eprintln!("not a git repository");
        return Ok(exit::USAGE);
    }

    if let Some(command) = &args.run_tests {
        let (passed, summary) = gitbridge::run_tests(command, &cwd).await;
        if !passed {
            eprintln!("tests failed:\n{summary}");
            return Ok(exit::TESTS_FAILED);
        }
    }

    let diff = gitbridge::staged_diff(Some(&cwd));
    if diff.is_empty() {
        eprintln!("nothing staged");
        return Ok(exit::FAILURE);
    }
    let files = gitbridge::staged_files(Some(&cwd));
    let patch_hash = gitbridge::compute_patch_hash(&diff);
    let patch_id = gitbridge::compute_patch_id_stable(&diff, Some(&cwd)).unwrap_or_default();

    let (ok, sha, err) = gitbridge::git_commit(&args.message, &[], "", Some(&cwd));
    if !ok {
        eprintln!("commit failed: {err}");
        return Ok(exit::FAILURE);
    }

    weave::append_weave(
        pool,
        data_dir,
        WeaveParams {
            git_commit_sha: sha.clone(),
            git_patch_hash: patch_hash.clone(),
            affected_symbols: files.clone(),
            ..Default::default()
        },
    )
    .await?;

    EventLog::new(data_dir).append(
        EventKind::Commit,
        &args.agent,
        serde_json::json!({
            "sha": &sha,
            "patch_hash": &patch_hash,
            "patch_id": &patch_id,
            "files": &files,
        }),
    )?;

    println!("{sha}");
    Ok(exit::OK)
}
