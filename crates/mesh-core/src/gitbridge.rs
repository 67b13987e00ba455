//! Git bridge: worktrees, stable patch ids, commits, and test runs.
//!
//! Everything shells out to the `git` CLI. Worktree removal is idempotent
//! and tolerates trees that were deleted externally.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::canon::sha256_hex;

/// Errors from git subprocess plumbing.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<(i32, String, String), GitError> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command.output().map_err(|source| GitError::Command {
        command: args.join(" "),
        source,
    })?;
    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).trim().to_owned(),
        String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    ))
}

/// Whether `cwd` is inside a git working tree.
pub fn is_git_repo(cwd: &Path) -> bool {
    matches!(
        run_git(&["rev-parse", "--is-inside-work-tree"], Some(cwd)),
        Ok((0, ref out, _)) if out == "true"
    )
}

/// Whether a local branch exists.
pub fn branch_exists(branch: &str, cwd: &Path) -> Result<bool, GitError> {
    let spec = format!("refs/heads/{branch}");
    let (code, _, _) = run_git(&["rev-parse", "--verify", &spec], Some(cwd))?;
    Ok(code == 0)
}

/// Create a worktree at `path` tracking `branch`, creating the branch when
/// it does not exist yet.
pub fn create_worktree(branch: &str, path: &Path, cwd: &Path) -> Result<(), GitError> {
    let path_str = path.to_string_lossy();
    let args: Vec<&str> = if branch_exists(branch, cwd)? {
        vec!["worktree", "add", &path_str, branch]
    } else {
        vec!["worktree", "add", "-b", branch, &path_str]
    };

    let (code, _, stderr) = run_git(&args, Some(cwd))?;
    if code != 0 {
        // Clean up any partially created directory.
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
        return Err(GitError::Exit {
            command: "worktree add".to_owned(),
            code,
            stderr,
        });
    }
    Ok(())
}

/// Remove a worktree. Idempotent: unregistered or already-deleted trees
/// are not errors, and the registration is pruned afterwards.
pub fn remove_worktree(path: &Path, cwd: Option<&Path>, force: bool) -> Result<(), GitError> {
    let path_str = path.to_string_lossy();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&path_str);

    let result = run_git(&args, cwd);
    match result {
        Ok((0, _, _)) => {}
        Ok((_, _, stderr)) if stderr.contains("is not a working tree") => {
            if path.exists() {
                let _ = std::fs::remove_dir_all(path);
            }
        }
        Ok((code, _, stderr)) => {
            // The repo may be gone entirely; fall back to removing the dir.
            if path.exists() {
                let _ = std::fs::remove_dir_all(path);
            } else {
                tracing::debug!(code, stderr, "worktree remove failed on absent tree");
            }
        }
        Err(err) => return Err(err),
    }

    let _ = run_git(&["worktree", "prune"], cwd);
    Ok(())
}

/// The staged diff (`git diff --cached`).
pub fn staged_diff(cwd: Option<&Path>) -> String {
    run_git(&["diff", "--cached"], cwd)
        .map(|(_, out, _)| out)
        .unwrap_or_default()
}

/// Staged file paths (`git diff --cached --name-only`).
pub fn staged_files(cwd: Option<&Path>) -> Vec<String> {
    run_git(&["diff", "--cached", "--name-only"], cwd)
        .map(|(_, out, _)| {
            out.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// SHA-256 of a diff text, as `sha256:<hex>`.
pub fn compute_patch_hash(diff_text: &str) -> String {
    format!("sha256:{}", sha256_hex(diff_text.as_bytes()))
}

/// `git patch-id --stable` over a diff. `None` for empty or unparsable
/// input.
pub fn compute_patch_id_stable(diff_text: &str, cwd: Option<&Path>) -> Option<String> {
    if diff_text.is_empty() {
        return None;
    }
    let mut command = Command::new("git");
    command
        .args(["patch-id", "--stable"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().ok()?;
    {
        use std::io::Write;
        let stdin = child.stdin.as_mut()?;
        stdin.write_all(diff_text.as_bytes()).ok()?;
    }
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    // Output format: "<patch-id> <commit-sha-or-zero>"
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .next()
        .map(str::to_owned)
}

/// Commit staged changes. Returns `(success, head_sha, error)`. A
/// non-empty trailer is appended after a blank line.
pub fn git_commit(
    message: &str,
    extra_args: &[&str],
    trailer: &str,
    cwd: Option<&Path>,
) -> (bool, String, String) {
    let full_message = if trailer.is_empty() {
        message.to_owned()
    } else {
        format!("{message}\n\n{trailer}")
    };

    let mut args = vec!["commit", "-m", &full_message];
    args.extend_from_slice(extra_args);

    match run_git(&args, cwd) {
        Ok((0, _, _)) => {
            let sha = run_git(&["rev-parse", "HEAD"], cwd)
                .map(|(_, out, _)| out)
                .unwrap_or_default();
            (true, sha, String::new())
        }
        Ok((_, _, stderr)) => (false, String::new(), stderr),
        Err(err) => (false, String::new(), err.to_string()),
    }
}

/// Run a user-provided test command through the shell, with a 300 s cap.
/// Returns `(passed, summary)` where the summary is the last 20 lines of
/// combined output.
pub async fn run_tests(command: &str, cwd: &Path) -> (bool, String) {
    let mut child = tokio::process::Command::new("sh");
    child
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_secs(300), child.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return (false, err.to_string()),
        Err(_) => return (false, "Test command timed out (300s)".to_owned()),
    };

    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let lines: Vec<&str> = combined.trim().lines().collect();
    let tail = lines[lines.len().saturating_sub(20)..].join("\n");
    (output.status.success(), tail)
}
