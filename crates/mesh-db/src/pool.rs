use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::config::DataDir;

/// Open (creating if necessary) the store at `data_dir/board.db`.
///
/// WAL journal mode, 5 s busy timeout, and foreign keys on — the store is
/// shared by concurrent processes and relies on SQLite's own write
/// serialization plus the busy-retry layer in [`crate::retry`].
pub async fn connect(data_dir: &DataDir) -> Result<SqlitePool> {
    data_dir
        .ensure_exists()
        .with_context(|| format!("failed to create data dir {}", data_dir.root().display()))?;

    let options = SqliteConnectOptions::new()
        .filename(data_dir.board_db())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!(
                "failed to open store at {}",
                data_dir.board_db().display()
            )
        })?;

    Ok(pool)
}

/// Open the store and bring the schema up to date.
pub async fn connect_and_migrate(data_dir: &DataDir) -> Result<SqlitePool> {
    let pool = connect(data_dir).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        kind TEXT NOT NULL DEFAULT 'claude_code',
        display_name TEXT NOT NULL DEFAULT '',
        cwd TEXT NOT NULL DEFAULT '',
        pid INTEGER,
        status TEXT NOT NULL DEFAULT 'idle'
            CHECK(status IN ('idle','busy','blocked','gone')),
        registered_at TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS claims (
        claim_id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL REFERENCES agents(agent_id),
        resource_type TEXT NOT NULL DEFAULT 'file'
            CHECK(resource_type IN ('file','port','lock','test_suite','temp_dir')),
        path TEXT NOT NULL,
        intent TEXT NOT NULL DEFAULT 'edit'
            CHECK(intent IN ('edit','read','test','review')),
        state TEXT NOT NULL DEFAULT 'active'
            CHECK(state IN ('active','released','expired')),
        ttl_s INTEGER NOT NULL DEFAULT 1800,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        released_at TEXT NOT NULL DEFAULT '',
        reason TEXT NOT NULL DEFAULT '',
        episode_id TEXT NOT NULL DEFAULT '',
        priority INTEGER NOT NULL DEFAULT 5,
        effective_priority INTEGER NOT NULL DEFAULT 5
    )",
    "CREATE INDEX IF NOT EXISTS idx_claims_active_path
        ON claims(resource_type, path) WHERE state = 'active'",
    "CREATE TABLE IF NOT EXISTS waiters (
        waiter_id TEXT PRIMARY KEY,
        resource_type TEXT NOT NULL DEFAULT 'file',
        path TEXT NOT NULL,
        waiter_agent_id TEXT NOT NULL DEFAULT '',
        episode_id TEXT NOT NULL DEFAULT '',
        priority INTEGER NOT NULL DEFAULT 5,
        reason TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL DEFAULT 'planned'
            CHECK(state IN ('planned','assigned','running','pr_open',
                            'ci_pass','review_pass','merged','aborted')),
        assigned_agent_id TEXT NOT NULL DEFAULT '',
        episode_id TEXT NOT NULL DEFAULT '',
        branch TEXT NOT NULL DEFAULT '',
        pr_url TEXT NOT NULL DEFAULT '',
        parent_task_id TEXT NOT NULL DEFAULT '',
        meta TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS task_deps (
        task_id TEXT NOT NULL REFERENCES tasks(task_id),
        depends_on TEXT NOT NULL REFERENCES tasks(task_id),
        PRIMARY KEY (task_id, depends_on)
    )",
    "CREATE TABLE IF NOT EXISTS attempts (
        attempt_id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(task_id),
        agent_id TEXT NOT NULL,
        attempt_number INTEGER NOT NULL DEFAULT 1,
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL DEFAULT '',
        outcome TEXT NOT NULL DEFAULT '',
        error_summary TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS spawns (
        spawn_id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(task_id),
        attempt_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        pid INTEGER NOT NULL DEFAULT 0,
        pid_started_at REAL NOT NULL DEFAULT 0.0,
        worktree_path TEXT NOT NULL DEFAULT '',
        branch TEXT NOT NULL DEFAULT '',
        episode_id TEXT NOT NULL DEFAULT '',
        context_hash TEXT NOT NULL DEFAULT '',
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL DEFAULT '',
        outcome TEXT NOT NULL DEFAULT '',
        output_path TEXT NOT NULL DEFAULT '',
        repo_cwd TEXT NOT NULL DEFAULT '',
        timeout_s INTEGER NOT NULL DEFAULT 0,
        backend TEXT NOT NULL DEFAULT 'claude_code',
        backend_version TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS weave_events (
        event_id TEXT PRIMARY KEY,
        sequence_id INTEGER NOT NULL UNIQUE,
        episode_id TEXT NOT NULL DEFAULT '',
        prev_hash TEXT NOT NULL DEFAULT '',
        capsule_id TEXT NOT NULL DEFAULT '',
        git_commit_sha TEXT NOT NULL DEFAULT '',
        git_patch_hash TEXT NOT NULL DEFAULT '',
        affected_symbols TEXT NOT NULL DEFAULT '[]',
        trace_id TEXT NOT NULL DEFAULT '',
        parent_event_id TEXT NOT NULL DEFAULT '',
        event_hash TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS episodes (
        episode_id TEXT PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL DEFAULT '',
        parent_episode_id TEXT NOT NULL DEFAULT ''
    )",
];

/// Apply the schema. Safe to run on every startup: table creation is
/// guarded, and column additions go through [`ensure_column`] so rows
/// written by older binaries keep working.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("failed to apply schema statement")?;
    }

    // Additive upgrades for stores created before these columns existed.
    ensure_column(pool, "claims", "episode_id", "TEXT NOT NULL DEFAULT ''").await?;
    ensure_column(pool, "claims", "priority", "INTEGER NOT NULL DEFAULT 5").await?;
    ensure_column(
        pool,
        "claims",
        "effective_priority",
        "INTEGER NOT NULL DEFAULT 5",
    )
    .await?;
    ensure_column(pool, "spawns", "timeout_s", "INTEGER NOT NULL DEFAULT 0").await?;
    ensure_column(pool, "spawns", "pid_started_at", "REAL NOT NULL DEFAULT 0.0").await?;
    ensure_column(
        pool,
        "spawns",
        "backend",
        "TEXT NOT NULL DEFAULT 'claude_code'",
    )
    .await?;
    ensure_column(pool, "spawns", "backend_version", "TEXT NOT NULL DEFAULT ''").await?;

    debug!("store migrations applied");
    Ok(())
}

/// Add a column if it is missing. No-op when the column already exists.
async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, ddl: &str) -> Result<()> {
    // Table and column names come from compile-time constants, never user
    // input, so string formatting is safe here.
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to inspect table {table}"))?;

    let present = rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column);
    if present {
        return Ok(());
    }

    sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
        .execute(pool)
        .await
        .with_context(|| format!("failed to add column {table}.{column}"))?;

    debug!(table, column, "added missing column");
    Ok(())
}

/// Return `(table, row_count)` for every user table in the store.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table,) in &tables {
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table.clone(), count.0));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let data_dir = DataDir::new(dir.path());
        let pool = connect(&data_dir).await.expect("connect");

        run_migrations(&pool).await.expect("first run");
        run_migrations(&pool).await.expect("second run");

        let counts = table_counts(&pool).await.expect("counts");
        let names: Vec<&str> = counts.iter().map(|(n, _)| n.as_str()).collect();
        for expected in [
            "agents",
            "attempts",
            "claims",
            "episodes",
            "spawns",
            "task_deps",
            "tasks",
            "waiters",
            "weave_events",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn ensure_column_tolerates_legacy_tables() {
        let dir = TempDir::new().expect("temp dir");
        let data_dir = DataDir::new(dir.path());
        let pool = connect(&data_dir).await.expect("connect");

        // Simulate a legacy store whose claims table predates priorities.
        sqlx::query(
            "CREATE TABLE claims (
                claim_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                resource_type TEXT NOT NULL DEFAULT 'file',
                path TEXT NOT NULL,
                intent TEXT NOT NULL DEFAULT 'edit',
                state TEXT NOT NULL DEFAULT 'active',
                ttl_s INTEGER NOT NULL DEFAULT 1800,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                released_at TEXT NOT NULL DEFAULT '',
                reason TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&pool)
        .await
        .expect("legacy table");

        run_migrations(&pool).await.expect("migrate legacy");

        let rows = sqlx::query("PRAGMA table_info(claims)")
            .fetch_all(&pool)
            .await
            .expect("pragma");
        let cols: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
        assert!(cols.contains(&"priority".to_owned()));
        assert!(cols.contains(&"effective_priority".to_owned()));
        assert!(cols.contains(&"episode_id".to_owned()));
    }
}
