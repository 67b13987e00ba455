//! Query functions for the `agents` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Agent, AgentStatus, now_ts};

/// Insert or replace an agent row. Registration is an upsert so that a
/// returning agent (same `agent_id`) refreshes its own record.
pub async fn register_agent(pool: &SqlitePool, agent: &Agent) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO agents \
         (agent_id, kind, display_name, cwd, pid, status, registered_at, last_heartbeat) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&agent.agent_id)
    .bind(agent.kind)
    .bind(&agent.display_name)
    .bind(&agent.cwd)
    .bind(agent.pid)
    .bind(agent.status)
    .bind(&agent.registered_at)
    .bind(&agent.last_heartbeat)
    .execute(pool)
    .await
    .with_context(|| format!("failed to register agent {}", agent.agent_id))?;

    Ok(())
}

/// Mark an agent `gone`. Returns `true` if the row existed.
pub async fn deregister_agent(pool: &SqlitePool, agent_id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE agents SET status = 'gone' WHERE agent_id = ?")
        .bind(agent_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to deregister agent {agent_id}"))?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single agent by id.
pub async fn get_agent(pool: &SqlitePool, agent_id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE agent_id = ?")
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch agent {agent_id}"))?;

    Ok(agent)
}

/// List agents ordered by registration time, optionally including `gone`
/// rows.
pub async fn list_agents(pool: &SqlitePool, include_gone: bool) -> Result<Vec<Agent>> {
    let query = if include_gone {
        "SELECT * FROM agents ORDER BY registered_at"
    } else {
        "SELECT * FROM agents WHERE status != 'gone' ORDER BY registered_at"
    };
    let agents = sqlx::query_as::<_, Agent>(query)
        .fetch_all(pool)
        .await
        .context("failed to list agents")?;

    Ok(agents)
}

/// Refresh an agent's heartbeat, optionally updating its status. Returns
/// `true` if the row existed.
pub async fn update_heartbeat(
    pool: &SqlitePool,
    agent_id: &str,
    status: Option<AgentStatus>,
    ts: Option<&str>,
) -> Result<bool> {
    let t = ts.map(str::to_owned).unwrap_or_else(now_ts);
    let result = match status {
        Some(status) => {
            sqlx::query("UPDATE agents SET last_heartbeat = ?, status = ? WHERE agent_id = ?")
                .bind(&t)
                .bind(status)
                .bind(agent_id)
                .execute(pool)
                .await
        }
        None => {
            sqlx::query("UPDATE agents SET last_heartbeat = ? WHERE agent_id = ?")
                .bind(&t)
                .bind(agent_id)
                .execute(pool)
                .await
        }
    }
    .with_context(|| format!("failed to update heartbeat for {agent_id}"))?;

    Ok(result.rows_affected() > 0)
}
