//! Task lifecycle commands.

use clap::{Args, Subcommand};
use sqlx::SqlitePool;

use mesh_core::machine::{self, CreateTask, TransitionError};
use mesh_db::config::DataDir;
use mesh_db::models::TaskState;
use mesh_db::queries::attempts as attempts_db;
use mesh_db::queries::tasks as tasks_db;
use mesh_db::queries::tasks::TaskFieldUpdate;

use crate::exit;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task in planned state
    Create(CreateArgs),
    /// Assign a planned task to an agent
    Assign {
        task_id: String,
        agent_id: String,
        #[arg(long, default_value = "")]
        branch: String,
    },
    /// Advance a task along the lifecycle DAG
    Advance {
        task_id: String,
        /// Target state (running, pr_open, ci_pass, review_pass, ...)
        to: String,
        #[arg(long, default_value = "")]
        agent: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long)]
        pr_url: Option<String>,
    },
    /// Abort a task from any non-terminal state
    Abort {
        task_id: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "")]
        agent: String,
    },
    /// Merge a task that passed review
    Complete {
        task_id: String,
        #[arg(long, default_value = "")]
        agent: String,
    },
    /// List tasks
    List {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Show one task with its attempts
    Show { task_id: String },
}

#[derive(Args)]
pub struct CreateArgs {
    pub title: String,
    #[arg(long, default_value = "")]
    pub description: String,
    /// Task ids this task depends on (repeatable)
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,
    #[arg(long, default_value = "")]
    pub parent: String,
    /// Opaque metadata as a JSON object
    #[arg(long)]
    pub meta: Option<String>,
}

fn transition_exit(err: TransitionError) -> anyhow::Result<u8> {
    match err {
        TransitionError::Store(inner) => Err(inner),
        other => {
            eprintln!("{other}");
            Ok(exit::FAILURE)
        }
    }
}

pub async fn run(
    pool: &SqlitePool,
    data_dir: &DataDir,
    command: TaskCommands,
) -> anyhow::Result<u8> {
    match command {
        TaskCommands::Create(args) => {
            let meta = match &args.meta {
                Some(raw) => match serde_json::from_str(raw) {
                    Ok(value) => value,
                    Err(err) => {
                        eprintln!("invalid --meta JSON: {err}");
                        return Ok(exit::USAGE);
                    }
                },
                None => serde_json::json!({}),
            };
            let input = CreateTask {
                title: args.title,
                description: args.description,
                episode_id: None,
                parent_task_id: args.parent,
                depends_on: args.depends_on,
                meta,
            };
            match machine::create_task(pool, data_dir, input).await {
                Ok(task) => {
                    println!("{}", task.task_id);
                    Ok(exit::OK)
                }
                Err(err) => transition_exit(err),
            }
        }
        TaskCommands::Assign {
            task_id,
            agent_id,
            branch,
        } => match machine::assign(pool, data_dir, &task_id, &agent_id, &branch).await {
            Ok(task) => {
                println!("{} -> {}", task.task_id, task.state);
                Ok(exit::OK)
            }
            Err(err) => transition_exit(err),
        },
        TaskCommands::Advance {
            task_id,
            to,
            agent,
            reason,
            pr_url,
        } => {
            let to_state: TaskState = match to.parse() {
                Ok(state) => state,
                Err(err) => {
                    eprintln!("{err}");
                    return Ok(exit::USAGE);
                }
            };
            let fields = TaskFieldUpdate {
                pr_url,
                ..Default::default()
            };
            match machine::transition(pool, data_dir, &task_id, to_state, &agent, &reason, fields)
                .await
            {
                Ok(task) => {
                    println!("{} -> {}", task.task_id, task.state);
                    Ok(exit::OK)
                }
                Err(err) => transition_exit(err),
            }
        }
        TaskCommands::Abort {
            task_id,
            reason,
            agent,
        } => match machine::abort(pool, data_dir, &task_id, &reason, &agent).await {
            Ok(task) => {
                println!("{} -> {}", task.task_id, task.state);
                Ok(exit::OK)
            }
            Err(err) => transition_exit(err),
        },
        TaskCommands::Complete { task_id, agent } => {
            match machine::complete(pool, data_dir, &task_id, &agent).await {
                Ok(task) => {
                    println!("{} -> {}", task.task_id, task.state);
                    Ok(exit::OK)
                }
                Err(err) => transition_exit(err),
            }
        }
        TaskCommands::List { agent, limit } => {
            let tasks = tasks_db::list_tasks(pool, agent.as_deref(), limit).await?;
            for task in tasks {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.task_id, task.state, task.assigned_agent_id, task.title
                );
            }
            Ok(exit::OK)
        }
        TaskCommands::Show { task_id } => {
            let Some(task) = tasks_db::get_task(pool, &task_id).await? else {
                eprintln!("task {task_id} not found");
                return Ok(exit::FAILURE);
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
            let attempts = attempts_db::list_attempts(pool, &task_id).await?;
            for attempt in attempts {
                println!(
                    "attempt #{} by {}: outcome={:?} started={} ended={}",
                    attempt.attempt_number,
                    attempt.agent_id,
                    attempt.outcome,
                    attempt.started_at,
                    attempt.ended_at
                );
            }
            Ok(exit::OK)
        }
    }
}
