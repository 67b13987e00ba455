mod agent_cmds;
mod claim_cmds;
mod evidence_cmds;
mod orch_cmds;
mod spawn_cmds;
mod task_cmds;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use mesh_db::config::DataDir;

/// Exit codes shared across subcommands.
pub mod exit {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const USAGE: u8 = 2;
    pub const WEAVE_BROKEN: u8 = 4;
    pub const TESTS_FAILED: u8 = 6;
}

#[derive(Parser)]
#[command(name = "mesh", about = "Coordination and evidence kernel for agent fleets")]
struct Cli {
    /// Data directory (overrides AGENTMESH_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and initialize the store
    Init,
    /// Register an agent (upsert)
    Register(agent_cmds::RegisterArgs),
    /// Mark an agent gone
    Deregister { agent_id: String },
    /// Refresh an agent's heartbeat
    Heartbeat(agent_cmds::HeartbeatArgs),
    /// List agents
    Agents {
        /// Include agents marked gone
        #[arg(long)]
        all: bool,
    },
    /// Claim a resource
    Claim(claim_cmds::ClaimArgs),
    /// Release claims
    Release(claim_cmds::ReleaseArgs),
    /// Show active edit claims on a resource
    Check {
        resource: String,
        #[arg(long)]
        exclude_agent: Option<String>,
    },
    /// Register a wait on a claimed resource (priority inheritance)
    Wait(claim_cmds::WaitArgs),
    /// Steal a stale holder's claim
    Steal(claim_cmds::StealArgs),
    /// Task lifecycle
    Task {
        #[command(subcommand)]
        command: task_cmds::TaskCommands,
    },
    /// Worker spawns
    Spawn {
        #[command(subcommand)]
        command: spawn_cmds::SpawnCommands,
    },
    /// Run one watchdog reconciliation pass
    Watchdog {
        #[arg(long, default_value_t = 300)]
        stale_threshold: i64,
        /// Timeout applied to spawns recorded without one (0 = none)
        #[arg(long, default_value_t = 0)]
        default_timeout: i64,
    },
    /// Event log operations
    Events {
        #[command(subcommand)]
        command: evidence_cmds::EventsCommands,
    },
    /// Weave ledger operations
    Weave {
        #[command(subcommand)]
        command: evidence_cmds::WeaveCommands,
    },
    /// Alpha gate reports
    Gate {
        #[command(subcommand)]
        command: evidence_cmds::GateCommands,
    },
    /// Episode lifecycle
    Episode {
        #[command(subcommand)]
        command: orch_cmds::EpisodeCommands,
    },
    /// Orchestrator control (freeze, merge lock, lease)
    Orch {
        #[command(subcommand)]
        command: orch_cmds::OrchCommands,
    },
    /// Commit staged changes with a provenance receipt
    Commit(orch_cmds::CommitArgs),
    /// Remove old settled rows from the store
    Gc {
        #[arg(long, default_value_t = 72)]
        max_age_hours: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = DataDir::resolve(cli.data_dir.as_deref());

    match run(cli.command, &data_dir).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit::FAILURE)
        }
    }
}

async fn run(command: Commands, data_dir: &DataDir) -> anyhow::Result<u8> {
    let pool = mesh_db::pool::connect_and_migrate(data_dir).await?;

    match command {
        Commands::Init => {
            let counts = mesh_db::pool::table_counts(&pool).await?;
            println!("initialized {}", data_dir.root().display());
            for (table, count) in counts {
                println!("  {table}: {count}");
            }
            Ok(exit::OK)
        }
        Commands::Register(args) => agent_cmds::register(&pool, data_dir, args).await,
        Commands::Deregister { agent_id } => {
            agent_cmds::deregister(&pool, data_dir, &agent_id).await
        }
        Commands::Heartbeat(args) => agent_cmds::heartbeat(&pool, &args).await,
        Commands::Agents { all } => agent_cmds::list(&pool, all).await,
        Commands::Claim(args) => claim_cmds::claim(&pool, data_dir, args).await,
        Commands::Release(args) => claim_cmds::release(&pool, data_dir, args).await,
        Commands::Check {
            resource,
            exclude_agent,
        } => claim_cmds::check(&pool, &resource, exclude_agent.as_deref()).await,
        Commands::Wait(args) => claim_cmds::wait(&pool, data_dir, args).await,
        Commands::Steal(args) => claim_cmds::steal(&pool, data_dir, args).await,
        Commands::Task { command } => task_cmds::run(&pool, data_dir, command).await,
        Commands::Spawn { command } => spawn_cmds::run(&pool, data_dir, command).await,
        Commands::Watchdog {
            stale_threshold,
            default_timeout,
        } => {
            let registry = mesh_core::adapter::AdapterRegistry::with_builtins();
            let result = mesh_core::watchdog::scan(
                &pool,
                data_dir,
                &registry,
                stale_threshold,
                default_timeout,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit::OK)
        }
        Commands::Events { command } => evidence_cmds::run_events(data_dir, command),
        Commands::Weave { command } => evidence_cmds::run_weave(&pool, command).await,
        Commands::Gate { command } => evidence_cmds::run_gate(&pool, data_dir, command).await,
        Commands::Episode { command } => orch_cmds::run_episode(&pool, data_dir, command).await,
        Commands::Orch { command } => orch_cmds::run_orch(&pool, data_dir, command).await,
        Commands::Commit(args) => orch_cmds::commit(&pool, data_dir, args).await,
        Commands::Gc { max_age_hours } => {
            let counts = mesh_db::queries::gc::gc_old_data(&pool, max_age_hours).await?;
            if counts.total() > 0 {
                mesh_core::eventlog::EventLog::new(data_dir).append(
                    mesh_db::models::EventKind::Gc,
                    "",
                    serde_json::json!({
                        "claims": counts.claims,
                        "agents": counts.agents,
                        "waiters": counts.waiters,
                    }),
                )?;
            }
            println!(
                "removed {} claims, {} agents, {} waiters",
                counts.claims, counts.agents, counts.waiters
            );
            Ok(exit::OK)
        }
    }
}
