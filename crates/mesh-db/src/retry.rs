//! Busy-retry for transient SQLite contention.
//!
//! WAL mode allows one writer at a time; a second writer surfaces
//! `SQLITE_BUSY` ("database is locked"). Multi-statement operations that
//! must retry as a whole go through [`with_busy_retry`], which re-runs the
//! closure with exponential backoff plus jitter and surfaces the original
//! error once the budget is exhausted.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

const BUSY_MAX_RETRIES: u32 = 3;
const BUSY_BASE_DELAY_MS: u64 = 100;
const BUSY_JITTER_MAX_MS: u64 = 100;

/// Whether an error chain bottoms out in SQLite lock contention.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let text = cause.to_string().to_lowercase();
        text.contains("database is locked") || text.contains("database table is locked")
    })
}

/// Run `op`, retrying on contention with delays of 100, 200, 400 ms plus
/// 0–100 ms of jitter. Non-contention errors pass through untouched.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..=BUSY_MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                tracing::debug!(attempt, "store busy, retrying");
                last_err = Some(err);
                if attempt < BUSY_MAX_RETRIES {
                    let backoff = BUSY_BASE_DELAY_MS << attempt;
                    let jitter = rand::rng().random_range(0..=BUSY_JITTER_MAX_MS);
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    // Budget exhausted: surface the contention error we last observed.
    Err(last_err.expect("retry loop exits with an error"))
}
