//! Worker spawn commands.

use clap::Subcommand;
use sqlx::SqlitePool;

use mesh_core::adapter::AdapterRegistry;
use mesh_core::spawner::{self, SpawnError, SpawnRequest};
use mesh_db::config::DataDir;

use crate::exit;

#[derive(Subcommand)]
pub enum SpawnCommands {
    /// Launch a worker for an assigned task
    Run {
        task_id: String,
        agent_id: String,
        /// Repository the worktree is created under
        #[arg(long, default_value = ".")]
        repo: String,
        #[arg(long, default_value = "sonnet")]
        model: String,
        /// Per-spawn timeout in seconds (0 = none)
        #[arg(long, default_value_t = 0)]
        timeout: i64,
        #[arg(long, default_value = "claude_code")]
        backend: String,
    },
    /// Liveness probe (no side effects)
    Check { spawn_id: String },
    /// Finalize a finished worker
    Harvest {
        spawn_id: String,
        #[arg(long)]
        keep_worktree: bool,
    },
    /// Kill and finalize a running worker
    Abort {
        spawn_id: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long)]
        keep_worktree: bool,
    },
    /// List spawn records
    List {
        /// Only spawns that are not finalized
        #[arg(long)]
        active: bool,
    },
}

fn spawn_exit(err: SpawnError) -> anyhow::Result<u8> {
    match err {
        SpawnError::Store(inner) => Err(inner),
        other => {
            eprintln!("{other}");
            Ok(exit::FAILURE)
        }
    }
}

pub async fn run(
    pool: &SqlitePool,
    data_dir: &DataDir,
    command: SpawnCommands,
) -> anyhow::Result<u8> {
    let registry = AdapterRegistry::with_builtins();
    for warning in registry.load_errors() {
        tracing::warn!("{warning}");
    }

    match command {
        SpawnCommands::Run {
            task_id,
            agent_id,
            repo,
            model,
            timeout,
            backend,
        } => {
            let request = SpawnRequest {
                task_id,
                agent_id,
                repo_cwd: repo,
                model,
                timeout_s: timeout,
                backend,
            };
            match spawner::spawn(pool, data_dir, &registry, &request).await {
                Ok(record) => {
                    println!("{} pid={}", record.spawn_id, record.pid);
                    Ok(exit::OK)
                }
                Err(err) => spawn_exit(err),
            }
        }
        SpawnCommands::Check { spawn_id } => {
            match spawner::check(pool, &spawn_id).await {
                Ok(status) => {
                    println!(
                        "running={} exit_code={:?}",
                        status.running, status.exit_code
                    );
                    Ok(exit::OK)
                }
                Err(err) => spawn_exit(err),
            }
        }
        SpawnCommands::Harvest {
            spawn_id,
            keep_worktree,
        } => match spawner::harvest(pool, data_dir, &registry, &spawn_id, !keep_worktree).await {
            Ok(result) => {
                println!(
                    "{} outcome={} cost_usd={} tokens={}+{}",
                    result.spawn_id,
                    result.outcome,
                    result.cost_usd,
                    result.tokens_in,
                    result.tokens_out
                );
                Ok(exit::OK)
            }
            Err(err) => spawn_exit(err),
        },
        SpawnCommands::Abort {
            spawn_id,
            reason,
            keep_worktree,
        } => match spawner::abort(pool, data_dir, &spawn_id, &reason, !keep_worktree).await {
            Ok(record) => {
                println!("{} outcome={}", record.spawn_id, record.outcome);
                Ok(exit::OK)
            }
            Err(err) => spawn_exit(err),
        },
        SpawnCommands::List { active } => {
            let spawns = spawner::list_spawns(pool, active).await?;
            for spawn in spawns {
                println!(
                    "{}\ttask={}\tpid={}\toutcome={:?}\tstarted={}",
                    spawn.spawn_id, spawn.task_id, spawn.pid, spawn.outcome, spawn.started_at
                );
            }
            Ok(exit::OK)
        }
    }
}
