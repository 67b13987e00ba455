//! Evidence commands: event log, weave, and the alpha gate.

use std::path::PathBuf;

use clap::Subcommand;
use sqlx::SqlitePool;

use mesh_core::alpha_gate::{self, GateOptions};
use mesh_core::eventlog::EventLog;
use mesh_core::weave;
use mesh_db::config::DataDir;
use mesh_db::models::EventKind;

use crate::exit;

#[derive(Subcommand)]
pub enum EventsCommands {
    /// Re-verify the event log hash chain
    Verify,
    /// List events
    List {
        #[arg(long, default_value_t = 0)]
        since: i64,
    },
    /// Drop old events and re-chain the remainder
    Gc {
        #[arg(long, default_value_t = 72)]
        max_age_hours: i64,
    },
}

pub fn run_events(data_dir: &DataDir, command: EventsCommands) -> anyhow::Result<u8> {
    let log = EventLog::new(data_dir);
    match command {
        EventsCommands::Verify => {
            let (ok, reason) = log.verify_chain()?;
            if ok {
                println!("event chain intact");
                Ok(exit::OK)
            } else {
                println!("event chain BROKEN: {reason}");
                Ok(exit::FAILURE)
            }
        }
        EventsCommands::List { since } => {
            for event in log.read(since)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    event.seq,
                    event.ts,
                    event.kind,
                    serde_json::to_string(&event.payload)?
                );
            }
            Ok(exit::OK)
        }
        EventsCommands::Gc { max_age_hours } => {
            let removed = log.gc(max_age_hours)?;
            println!("removed {removed} events");
            Ok(exit::OK)
        }
    }
}

#[derive(Subcommand)]
pub enum WeaveCommands {
    /// Re-verify the weave chain and sequence ids
    Verify,
    /// List weave records
    List {
        #[arg(long)]
        episode: Option<String>,
    },
}

pub async fn run_weave(pool: &SqlitePool, command: WeaveCommands) -> anyhow::Result<u8> {
    match command {
        WeaveCommands::Verify => {
            let (ok, reason) = weave::verify_weave(pool).await?;
            if ok {
                println!("weave chain intact");
                Ok(exit::OK)
            } else {
                println!("weave chain BROKEN: {reason}");
                Ok(exit::WEAVE_BROKEN)
            }
        }
        WeaveCommands::List { episode } => {
            let events =
                mesh_db::queries::weave::list_weave_events(pool, episode.as_deref()).await?;
            for event in events {
                println!(
                    "{}\t{}\ttrace={}\tcommit={}\t{}",
                    event.sequence_id,
                    event.event_id,
                    event.trace_id,
                    event.git_commit_sha,
                    event.created_at
                );
            }
            Ok(exit::OK)
        }
    }
}

#[derive(Subcommand)]
pub enum GateCommands {
    /// Build the alpha gate report
    Report {
        #[arg(long)]
        out: Option<PathBuf>,
        /// CI log text to scan for witness verification
        #[arg(long)]
        ci_log: Option<PathBuf>,
        /// CI result JSON carrying witness evidence
        #[arg(long)]
        ci_result: Option<PathBuf>,
        #[arg(long)]
        require_witness: bool,
    },
    /// Sanitize a raw report for publication
    Sanitize { input: PathBuf, output: PathBuf },
}

pub async fn run_gate(
    pool: &SqlitePool,
    data_dir: &DataDir,
    command: GateCommands,
) -> anyhow::Result<u8> {
    match command {
        GateCommands::Report {
            out,
            ci_log,
            ci_result,
            require_witness,
        } => {
            let ci_log_text = match ci_log {
                Some(path) => std::fs::read_to_string(path)?,
                None => String::new(),
            };
            let ci_result = match ci_result {
                Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };
            let options = GateOptions {
                ci_log_text,
                ci_result,
                require_witness_verified: require_witness,
            };

            // A broken weave is itself evidence.
            let (weave_ok, weave_err) = weave::verify_weave(pool).await?;
            if !weave_ok {
                EventLog::new(data_dir).append(
                    EventKind::WeaveChainBreak,
                    "",
                    serde_json::json!({ "error": weave_err }),
                )?;
            }

            let report = match out {
                Some(path) => alpha_gate::write_report(pool, data_dir, &options, &path).await?,
                None => alpha_gate::build_report(pool, data_dir, &options).await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);

            let pass = report["overall_pass"].as_bool().unwrap_or(false);
            Ok(if pass { exit::OK } else { exit::FAILURE })
        }
        GateCommands::Sanitize { input, output } => {
            let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&input)?)?;
            let clean = alpha_gate::sanitize_report(&raw);
            let mut text = serde_json::to_string_pretty(&clean)?;
            text.push('\n');
            std::fs::write(&output, text)?;
            println!("sanitized report written to {}", output.display());
            Ok(exit::OK)
        }
    }
}
