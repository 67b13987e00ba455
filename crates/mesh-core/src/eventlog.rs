//! Append-only JSONL event log with hash chaining.
//!
//! One JSON object per line in `events.jsonl`. Writers serialize through
//! an exclusive `flock` on the file so multiple processes can share one
//! data directory; `O_APPEND` keeps each line write atomic. Any reader can
//! independently re-verify the chain from the genesis hash.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mesh_db::config::DataDir;
use mesh_db::models::{EventKind, now_minus_secs, now_ts};

use crate::canon::{GENESIS_HASH, hash_without_event_hash};

/// One operational log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub seq: i64,
    pub ts: String,
    pub kind: EventKind,
    pub agent_id: String,
    pub payload: Value,
    pub prev_hash: String,
    pub event_hash: String,
}

/// Handle to the event log of one data directory.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// The log inside `data_dir` (`events.jsonl`).
    pub fn new(data_dir: &DataDir) -> Self {
        Self {
            path: data_dir.events_file(),
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one event. Process-safe: the `(seq, prev_hash)` read and the
    /// line write happen under an exclusive file lock.
    pub fn append(&self, kind: EventKind, agent_id: &str, payload: Value) -> Result<Event> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let _lock = FileLock::exclusive(&file)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;

        let (prev_seq, prev_hash) = self.last_chain_state()?;
        let seq = prev_seq + 1;

        let mut event = Event {
            event_id: format!("evt_{seq:06}"),
            seq,
            ts: now_ts(),
            kind,
            agent_id: agent_id.to_owned(),
            payload,
            prev_hash,
            event_hash: String::new(),
        };
        let value = serde_json::to_value(&event).context("failed to serialize event")?;
        event.event_hash = hash_without_event_hash(&value);

        let mut line = serde_json::to_string(&event).context("failed to serialize event")?;
        line.push('\n');
        (&file)
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        Ok(event)
    }

    /// Read events with `seq > since_seq`. A missing file is an empty log.
    pub fn read(&self, since_seq: i64) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut events = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(trimmed)
                .with_context(|| format!("malformed event line: {trimmed}"))?;
            if event.seq > since_seq {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Walk the whole chain from genesis. Returns `(true, "")` on success
    /// or `(false, reason)` at the first break.
    pub fn verify_chain(&self) -> Result<(bool, String)> {
        let events = self.read(0)?;
        let mut prev_hash = GENESIS_HASH.to_owned();
        for event in &events {
            if event.prev_hash != prev_hash {
                return Ok((
                    false,
                    format!(
                        "chain break at seq {}: expected prev_hash {prev_hash}, got {}",
                        event.seq, event.prev_hash
                    ),
                ));
            }
            let value = serde_json::to_value(event).context("failed to serialize event")?;
            let computed = hash_without_event_hash(&value);
            if event.event_hash != computed {
                return Ok((
                    false,
                    format!(
                        "hash mismatch at seq {}: stored={} computed={computed}",
                        event.seq, event.event_hash
                    ),
                ));
            }
            prev_hash = event.event_hash.clone();
        }
        Ok((true, String::new()))
    }

    /// Drop events older than `max_age_hours` and re-chain the remainder
    /// from genesis with renumbered `seq`s. All-or-nothing with respect to
    /// concurrent appenders (same lock). Returns the count removed.
    pub fn gc(&self, max_age_hours: i64) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let _lock = FileLock::exclusive(&file)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;

        let all = self.read(0)?;
        let cutoff = now_minus_secs(max_age_hours * 3600);
        let keep: Vec<&Event> = all.iter().filter(|e| e.ts >= cutoff).collect();
        let removed = all.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut prev_hash = GENESIS_HASH.to_owned();
        let mut lines = String::new();
        for (i, old) in keep.iter().enumerate() {
            let mut event = Event {
                event_id: old.event_id.clone(),
                seq: (i + 1) as i64,
                ts: old.ts.clone(),
                kind: old.kind,
                agent_id: old.agent_id.clone(),
                payload: old.payload.clone(),
                prev_hash: prev_hash.clone(),
                event_hash: String::new(),
            };
            let value = serde_json::to_value(&event).context("failed to serialize event")?;
            event.event_hash = hash_without_event_hash(&value);
            prev_hash = event.event_hash.clone();
            lines.push_str(&serde_json::to_string(&event)?);
            lines.push('\n');
        }

        file.set_len(0).context("failed to truncate event log")?;
        (&file)
            .write_all(lines.as_bytes())
            .context("failed to rewrite event log")?;

        tracing::info!(removed, path = %self.path.display(), "event log compacted");
        Ok(removed)
    }

    fn last_chain_state(&self) -> Result<(i64, String)> {
        if !self.path.exists() {
            return Ok((0, GENESIS_HASH.to_owned()));
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let last_line = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .next_back();
        match last_line {
            None => Ok((0, GENESIS_HASH.to_owned())),
            Some(line) => {
                let event: Event = serde_json::from_str(line)
                    .with_context(|| format!("malformed last event line: {line}"))?;
                Ok((event.seq, event.event_hash))
            }
        }
    }
}

/// RAII exclusive advisory lock on an open file.
struct FileLock<'f> {
    file: &'f File,
}

impl<'f> FileLock<'f> {
    #[cfg(unix)]
    fn exclusive(file: &'f File) -> std::io::Result<Self> {
        use std::os::unix::io::AsRawFd;
        // Blocks until the lock is granted; writers queue behind each other.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { file })
    }

    #[cfg(not(unix))]
    fn exclusive(file: &'f File) -> std::io::Result<Self> {
        // Advisory locking is unix-only; single-process use stays safe
        // through the store's own serialization.
        Ok(Self { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        let _ = self.file;
    }
}
