//! Task state machine: drives every task through the fixed lifecycle DAG,
//! writing each transition atomically with its weave receipt.
//!
//! The state update and the weave append commit in one store transaction;
//! the event-log record is published before the call returns. Terminal
//! transitions additionally emit the assay bridge receipt.

use anyhow::Result;
use sqlx::SqlitePool;
use sqlx::types::Json;
use thiserror::Error;

use mesh_db::config::DataDir;
use mesh_db::models::{Attempt, EventKind, Task, TaskState, new_id, now_ts};
use mesh_db::queries::attempts as attempts_db;
use mesh_db::queries::tasks as tasks_db;
use mesh_db::queries::tasks::TaskFieldUpdate;
use mesh_db::retry::with_busy_retry;
use mesh_db::tx;

use crate::bridge;
use crate::episode;
use crate::eventlog::EventLog;
use crate::weave::{self, WeaveParams};

/// Allowed next states for each state. Terminal states have no edges.
pub fn valid_transitions(from: TaskState) -> &'static [TaskState] {
    use TaskState::*;
    match from {
        Planned => &[Assigned, Aborted],
        Assigned => &[Running, Aborted],
        Running => &[PrOpen, Aborted],
        PrOpen => &[CiPass, Aborted],
        CiPass => &[ReviewPass, Aborted],
        ReviewPass => &[Merged, Aborted],
        Merged | Aborted => &[],
    }
}

/// Typed failures of the task machine.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {task_id} is in terminal state {state}")]
    TerminalState { task_id: String, state: TaskState },

    #[error("cannot transition {task_id} from {from} to {to}; allowed: {allowed:?}")]
    IllegalTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
        allowed: Vec<TaskState>,
    },

    #[error("dependency cycle involving {0}")]
    DependencyCycle(String),

    #[error("task {task_id} has unresolved dependencies: {blocking:?}")]
    UnresolvedDependencies {
        task_id: String,
        blocking: Vec<String>,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TransitionError {
    /// Whether this is the benign "target already terminal" case that
    /// harvest/abort reconciliation swallows.
    pub fn is_terminal_state(&self) -> bool {
        matches!(self, Self::TerminalState { .. })
    }
}

fn downcast(err: anyhow::Error) -> TransitionError {
    match err.downcast::<TransitionError>() {
        Ok(typed) => typed,
        Err(other) => TransitionError::Store(other),
    }
}

/// Inputs for task creation.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub title: String,
    pub description: String,
    pub episode_id: Option<String>,
    pub parent_task_id: String,
    pub depends_on: Vec<String>,
    pub meta: serde_json::Value,
}

/// Create a task in `planned` state, with its dependency edges, a weave
/// receipt, and a `TASK_TRANSITION` event (`from_state` empty).
pub async fn create_task(
    pool: &SqlitePool,
    data_dir: &DataDir,
    input: CreateTask,
) -> Result<Task, TransitionError> {
    let task_id = new_id("task");

    for dep in &input.depends_on {
        if tasks_db::get_task(pool, dep).await?.is_none() {
            return Err(TransitionError::NotFound(dep.clone()));
        }
    }
    check_no_cycle(pool, &task_id, &input.depends_on).await?;

    let episode_id = input
        .episode_id
        .clone()
        .unwrap_or_else(|| episode::current_episode(data_dir));
    let now = now_ts();
    let meta = if input.meta.is_null() {
        serde_json::json!({})
    } else {
        input.meta.clone()
    };
    let task = Task {
        task_id: task_id.clone(),
        title: input.title.clone(),
        description: input.description.clone(),
        state: TaskState::Planned,
        assigned_agent_id: String::new(),
        episode_id: episode_id.clone(),
        branch: String::new(),
        pr_url: String::new(),
        parent_task_id: input.parent_task_id.clone(),
        meta: Json(meta),
        created_at: now.clone(),
        updated_at: now,
    };
    tasks_db::insert_task(pool, &task, &input.depends_on).await?;

    weave::append_weave(
        pool,
        data_dir,
        WeaveParams {
            trace_id: task_id.clone(),
            episode_id: Some(episode_id),
            ..Default::default()
        },
    )
    .await?;

    EventLog::new(data_dir).append(
        EventKind::TaskTransition,
        "",
        serde_json::json!({
            "task_id": task_id,
            "from_state": "",
            "to_state": TaskState::Planned,
            "title": input.title,
        }),
    )?;

    Ok(task)
}

/// DFS with color marks over existing edges plus the candidate edges.
async fn check_no_cycle(
    pool: &SqlitePool,
    new_task_id: &str,
    depends_on: &[String],
) -> Result<(), TransitionError> {
    use std::collections::HashMap;

    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for (from, to) in tasks_db::all_dependency_edges(pool).await? {
        edges.entry(from).or_default().push(to);
    }
    edges
        .entry(new_task_id.to_owned())
        .or_default()
        .extend(depends_on.iter().cloned());

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut colors: HashMap<&str, Color> = HashMap::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a HashMap<String, Vec<String>>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> bool {
        match colors.get(node).copied().unwrap_or(Color::White) {
            Color::Gray => return true, // back edge
            Color::Black => return false,
            Color::White => {}
        }
        colors.insert(node, Color::Gray);
        if let Some(next) = edges.get(node) {
            for dep in next {
                if visit(dep, edges, colors) {
                    return true;
                }
            }
        }
        colors.insert(node, Color::Black);
        false
    }

    let nodes: Vec<&str> = edges.keys().map(String::as_str).collect();
    for node in nodes {
        if visit(node, &edges, &mut colors) {
            return Err(TransitionError::DependencyCycle(new_task_id.to_owned()));
        }
    }
    Ok(())
}

/// Atomically transition a task.
///
/// Validates the edge, then commits the state update together with one
/// weave receipt (`trace_id = task_id`), then publishes the
/// `TASK_TRANSITION` event. Terminal targets also emit the assay receipt.
pub async fn transition(
    pool: &SqlitePool,
    data_dir: &DataDir,
    task_id: &str,
    to_state: TaskState,
    agent_id: &str,
    reason: &str,
    fields: TaskFieldUpdate,
) -> Result<Task, TransitionError> {
    let (from_state, episode_id) = with_busy_retry(|| {
        let fields = fields.clone();
        let task_id = task_id.to_owned();
        async move {
            tx::immediate(pool, move |conn| {
                let fields = fields.clone();
                let task_id = task_id.clone();
                Box::pin(async move {
                    let task = tasks_db::get_task(&mut *conn, &task_id)
                        .await?
                        .ok_or_else(|| {
                            anyhow::Error::new(TransitionError::NotFound(task_id.to_owned()))
                        })?;

                    if task.state.is_terminal() {
                        return Err(anyhow::Error::new(TransitionError::TerminalState {
                            task_id: task_id.to_owned(),
                            state: task.state,
                        }));
                    }
                    let allowed = valid_transitions(task.state);
                    if !allowed.contains(&to_state) {
                        return Err(anyhow::Error::new(TransitionError::IllegalTransition {
                            task_id: task_id.to_owned(),
                            from: task.state,
                            to: to_state,
                            allowed: allowed.to_vec(),
                        }));
                    }

                    tasks_db::update_task_state(
                        &mut *conn,
                        &task_id,
                        to_state,
                        &now_ts(),
                        &fields,
                    )
                    .await?;

                    weave::append_on_conn(
                        &mut *conn,
                        WeaveParams {
                            trace_id: task_id.to_owned(),
                            ..Default::default()
                        },
                        task.episode_id.clone(),
                    )
                    .await?;

                    Ok((task.state, task.episode_id))
                })
            })
            .await
        }
    })
    .await
    .map_err(downcast)?;

    EventLog::new(data_dir).append(
        EventKind::TaskTransition,
        agent_id,
        serde_json::json!({
            "task_id": task_id,
            "from_state": from_state,
            "to_state": to_state,
            "reason": reason,
        }),
    )?;

    tracing::info!(task_id, %from_state, %to_state, "task transitioned");

    if to_state.is_terminal() {
        bridge::emit_bridge_event(pool, data_dir, task_id, to_state, agent_id, &episode_id).await;
    }

    let updated = tasks_db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| TransitionError::NotFound(task_id.to_owned()))?;
    Ok(updated)
}

/// Assign a planned task to an agent.
///
/// Blocks with [`TransitionError::UnresolvedDependencies`] unless every
/// dependency has reached `pr_open` or later without aborting. Creates the
/// next attempt and logs the control-plane `WORKER_SPAWN` event.
pub async fn assign(
    pool: &SqlitePool,
    data_dir: &DataDir,
    task_id: &str,
    agent_id: &str,
    branch: &str,
) -> Result<Task, TransitionError> {
    let dep_states = tasks_db::dependency_states(pool, task_id).await?;
    let blocking: Vec<String> = dep_states
        .iter()
        .filter(|(_, state)| {
            !matches!(
                state,
                TaskState::PrOpen | TaskState::CiPass | TaskState::ReviewPass | TaskState::Merged
            )
        })
        .map(|(id, _)| id.clone())
        .collect();
    if !blocking.is_empty() {
        return Err(TransitionError::UnresolvedDependencies {
            task_id: task_id.to_owned(),
            blocking,
        });
    }

    let task = transition(
        pool,
        data_dir,
        task_id,
        TaskState::Assigned,
        agent_id,
        &format!("assigned to {agent_id}"),
        TaskFieldUpdate {
            assigned_agent_id: Some(agent_id.to_owned()),
            branch: Some(branch.to_owned()),
            pr_url: None,
        },
    )
    .await?;

    let existing = attempts_db::list_attempts(pool, task_id).await?;
    let attempt = Attempt {
        attempt_id: new_id("att"),
        task_id: task_id.to_owned(),
        agent_id: agent_id.to_owned(),
        attempt_number: existing.len() as i64 + 1,
        started_at: now_ts(),
        ended_at: String::new(),
        outcome: String::new(),
        error_summary: String::new(),
    };
    attempts_db::insert_attempt(pool, &attempt).await?;

    EventLog::new(data_dir).append(
        EventKind::WorkerSpawn,
        agent_id,
        serde_json::json!({
            "task_id": task_id,
            "attempt_id": attempt.attempt_id,
            "branch": branch,
        }),
    )?;

    Ok(task)
}

/// Abort a task from any non-terminal state. Ends the latest open attempt
/// (if any) with `aborted`, even when no spawn ever ran.
pub async fn abort(
    pool: &SqlitePool,
    data_dir: &DataDir,
    task_id: &str,
    reason: &str,
    agent_id: &str,
) -> Result<Task, TransitionError> {
    let reason = if reason.is_empty() { "aborted" } else { reason };
    let task = transition(
        pool,
        data_dir,
        task_id,
        TaskState::Aborted,
        agent_id,
        reason,
        TaskFieldUpdate::default(),
    )
    .await?;

    end_latest_open_attempt(pool, task_id, "aborted", reason).await?;
    Ok(task)
}

/// Merge a task that has passed review. Ends the latest open attempt with
/// `success` and logs `WORKER_DONE`.
pub async fn complete(
    pool: &SqlitePool,
    data_dir: &DataDir,
    task_id: &str,
    agent_id: &str,
) -> Result<Task, TransitionError> {
    let task = transition(
        pool,
        data_dir,
        task_id,
        TaskState::Merged,
        agent_id,
        "merged",
        TaskFieldUpdate::default(),
    )
    .await?;

    end_latest_open_attempt(pool, task_id, "success", "").await?;

    EventLog::new(data_dir).append(
        EventKind::WorkerDone,
        agent_id,
        serde_json::json!({ "task_id": task_id, "outcome": "success" }),
    )?;

    Ok(task)
}

async fn end_latest_open_attempt(
    pool: &SqlitePool,
    task_id: &str,
    outcome: &str,
    error_summary: &str,
) -> Result<()> {
    let attempts = attempts_db::list_attempts(pool, task_id).await?;
    if let Some(latest) = attempts.last() {
        if latest.ended_at.is_empty() {
            attempts_db::end_attempt(pool, &latest.attempt_id, outcome, error_summary).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_db::pool::connect_and_migrate;
    use mesh_db::queries::weave as weave_db;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, DataDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let data_dir = DataDir::new(dir.path());
        let pool = connect_and_migrate(&data_dir).await.unwrap();
        (dir, data_dir, pool)
    }

    fn simple(title: &str) -> CreateTask {
        CreateTask {
            title: title.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_starts_planned_with_receipt() {
        let (_dir, data_dir, pool) = setup().await;
        let task = create_task(&pool, &data_dir, simple("build the thing"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Planned);

        let receipts = weave_db::list_weave_events(&pool, None).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].trace_id, task.task_id);

        let events = EventLog::new(&data_dir).read(0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TaskTransition);
        assert_eq!(events[0].payload["to_state"], "planned");
    }

    #[tokio::test]
    async fn illegal_and_terminal_transitions_fail() {
        let (_dir, data_dir, pool) = setup().await;
        let task = create_task(&pool, &data_dir, simple("t")).await.unwrap();

        let err = transition(
            &pool,
            &data_dir,
            &task.task_id,
            TaskState::Merged,
            "",
            "",
            TaskFieldUpdate::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransitionError::IllegalTransition { .. }), "{err}");

        abort(&pool, &data_dir, &task.task_id, "give up", "").await.unwrap();

        let err = transition(
            &pool,
            &data_dir,
            &task.task_id,
            TaskState::Assigned,
            "",
            "",
            TaskFieldUpdate::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_terminal_state(), "{err}");

        let err = transition(
            &pool,
            &data_dir,
            "task_missing",
            TaskState::Assigned,
            "",
            "",
            TaskFieldUpdate::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn assign_creates_numbered_attempts() {
        let (_dir, data_dir, pool) = setup().await;
        let task = create_task(&pool, &data_dir, simple("t")).await.unwrap();

        let assigned = assign(&pool, &data_dir, &task.task_id, "a1", "feat/x")
            .await
            .unwrap();
        assert_eq!(assigned.state, TaskState::Assigned);
        assert_eq!(assigned.assigned_agent_id, "a1");
        assert_eq!(assigned.branch, "feat/x");

        let attempts = attempts_db::list_attempts(&pool, &task.task_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_number, 1);
        assert!(attempts[0].outcome.is_empty());
    }

    #[tokio::test]
    async fn assign_blocks_on_unresolved_dependencies() {
        let (_dir, data_dir, pool) = setup().await;
        let dep = create_task(&pool, &data_dir, simple("dep")).await.unwrap();
        let task = create_task(
            &pool,
            &data_dir,
            CreateTask {
                title: "blocked".to_owned(),
                depends_on: vec![dep.task_id.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = assign(&pool, &data_dir, &task.task_id, "a1", "feat/x")
            .await
            .unwrap_err();
        match err {
            TransitionError::UnresolvedDependencies { blocking, .. } => {
                assert_eq!(blocking, vec![dep.task_id.clone()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Drive the dependency to pr_open; the gate opens.
        assign(&pool, &data_dir, &dep.task_id, "a1", "feat/dep").await.unwrap();
        for state in [TaskState::Running, TaskState::PrOpen] {
            transition(&pool, &data_dir, &dep.task_id, state, "a1", "", TaskFieldUpdate::default())
                .await
                .unwrap();
        }
        assign(&pool, &data_dir, &task.task_id, "a1", "feat/x").await.unwrap();
    }

    #[tokio::test]
    async fn aborted_dependency_keeps_blocking() {
        let (_dir, data_dir, pool) = setup().await;
        let dep = create_task(&pool, &data_dir, simple("dep")).await.unwrap();
        let task = create_task(
            &pool,
            &data_dir,
            CreateTask {
                title: "blocked".to_owned(),
                depends_on: vec![dep.task_id.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        abort(&pool, &data_dir, &dep.task_id, "", "").await.unwrap();
        let err = assign(&pool, &data_dir, &task.task_id, "a1", "feat/x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::UnresolvedDependencies { .. }));
    }

    #[tokio::test]
    async fn unknown_dependency_is_not_found() {
        let (_dir, data_dir, pool) = setup().await;
        let err = create_task(
            &pool,
            &data_dir,
            CreateTask {
                title: "t".to_owned(),
                depends_on: vec!["task_nope".to_owned()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound(_)));
    }

    #[tokio::test]
    async fn full_lifecycle_emits_one_receipt_per_transition() {
        let (_dir, data_dir, pool) = setup().await;
        let task = create_task(&pool, &data_dir, simple("lifecycle")).await.unwrap();

        assign(&pool, &data_dir, &task.task_id, "a1", "feat/x").await.unwrap();
        for state in [
            TaskState::Running,
            TaskState::PrOpen,
            TaskState::CiPass,
            TaskState::ReviewPass,
        ] {
            transition(&pool, &data_dir, &task.task_id, state, "a1", "", TaskFieldUpdate::default())
                .await
                .unwrap();
        }
        let done = complete(&pool, &data_dir, &task.task_id, "a1").await.unwrap();
        assert_eq!(done.state, TaskState::Merged);

        // create + assign + 4 transitions + complete = 7 receipts.
        let receipts = weave_db::list_weave_events(&pool, None).await.unwrap();
        assert_eq!(receipts.len(), 7);

        let attempts = attempts_db::list_attempts(&pool, &task.task_id).await.unwrap();
        assert_eq!(attempts[0].outcome, "success");
        assert!(!attempts[0].ended_at.is_empty());
    }

    #[tokio::test]
    async fn abort_ends_open_attempt_without_spawn() {
        let (_dir, data_dir, pool) = setup().await;
        let task = create_task(&pool, &data_dir, simple("t")).await.unwrap();
        assign(&pool, &data_dir, &task.task_id, "a1", "feat/x").await.unwrap();

        abort(&pool, &data_dir, &task.task_id, "watchdog", "").await.unwrap();

        let attempts = attempts_db::list_attempts(&pool, &task.task_id).await.unwrap();
        assert_eq!(attempts[0].outcome, "aborted");
    }

    #[tokio::test]
    async fn terminal_transition_emits_assay_receipt() {
        let (_dir, data_dir, pool) = setup().await;
        let task = create_task(&pool, &data_dir, simple("t")).await.unwrap();
        abort(&pool, &data_dir, &task.task_id, "", "").await.unwrap();

        let events = EventLog::new(&data_dir).read(0).unwrap();
        let receipts: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::AssayReceipt)
            .collect();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].payload["task_id"], task.task_id);
        assert_eq!(receipts[0].payload["terminal_state"], "aborted");
    }
}
