//! Agent registration, heartbeat, and listing.

use clap::Args;
use sqlx::SqlitePool;

use mesh_core::eventlog::EventLog;
use mesh_db::config::DataDir;
use mesh_db::models::{Agent, AgentKind, AgentStatus, EventKind};
use mesh_db::queries::agents as agents_db;

use crate::exit;

#[derive(Args)]
pub struct RegisterArgs {
    pub agent_id: String,
    #[arg(long, default_value = "claude_code")]
    pub kind: String,
    #[arg(long, default_value = "")]
    pub display_name: String,
    #[arg(long)]
    pub cwd: Option<String>,
}

pub async fn register(
    pool: &SqlitePool,
    data_dir: &DataDir,
    args: RegisterArgs,
) -> anyhow::Result<u8> {
    let kind: AgentKind = match args.kind.parse() {
        Ok(kind) => kind,
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit::USAGE);
        }
    };

    let cwd = args.cwd.unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let mut agent = Agent::new(&args.agent_id, cwd);
    agent.kind = kind;
    agent.display_name = args.display_name;
    agent.pid = Some(std::process::id() as i64);

    agents_db::register_agent(pool, &agent).await?;
    EventLog::new(data_dir).append(
        EventKind::Register,
        &args.agent_id,
        serde_json::json!({ "kind": agent.kind, "cwd": agent.cwd }),
    )?;

    println!("registered {}", args.agent_id);
    Ok(exit::OK)
}

pub async fn deregister(
    pool: &SqlitePool,
    data_dir: &DataDir,
    agent_id: &str,
) -> anyhow::Result<u8> {
    let existed = agents_db::deregister_agent(pool, agent_id).await?;
    if !existed {
        eprintln!("agent {agent_id} not found");
        return Ok(exit::FAILURE);
    }
    // A departing agent releases everything it still holds.
    mesh_core::arbiter::release(pool, data_dir, agent_id, None, true).await?;
    EventLog::new(data_dir).append(EventKind::Deregister, agent_id, serde_json::json!({}))?;

    println!("deregistered {agent_id}");
    Ok(exit::OK)
}

#[derive(Args)]
pub struct HeartbeatArgs {
    pub agent_id: String,
    #[arg(long)]
    pub status: Option<String>,
}

pub async fn heartbeat(pool: &SqlitePool, args: &HeartbeatArgs) -> anyhow::Result<u8> {
    let status: Option<AgentStatus> = match &args.status {
        Some(raw) => match raw.parse() {
            Ok(status) => Some(status),
            Err(err) => {
                eprintln!("{err}");
                return Ok(exit::USAGE);
            }
        },
        None => None,
    };

    let existed = agents_db::update_heartbeat(pool, &args.agent_id, status, None).await?;
    if !existed {
        eprintln!("agent {} not found", args.agent_id);
        return Ok(exit::FAILURE);
    }
    Ok(exit::OK)
}

pub async fn list(pool: &SqlitePool, include_gone: bool) -> anyhow::Result<u8> {
    let agents = agents_db::list_agents(pool, include_gone).await?;
    for agent in agents {
        println!(
            "{}\t{}\t{}\tlast_heartbeat={}",
            agent.agent_id, agent.kind, agent.status, agent.last_heartbeat
        );
    }
    Ok(exit::OK)
}
