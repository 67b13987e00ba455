//! Repo policy: `.agentmesh/policy.json` under the repository root.
//!
//! Missing or malformed policy files degrade to the permissive default;
//! policy only ever narrows behavior, it never fails an operation by
//! absence.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

/// Allow-lists for worker adapters. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterPolicy {
    #[serde(default)]
    pub allow_backends: Vec<String>,
    #[serde(default)]
    pub allow_modules: Vec<String>,
    #[serde(default)]
    pub allow_paths: Vec<String>,
}

/// Worker runtime knobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimePolicy {
    /// Environment keys stripped from the child environment, in addition
    /// to the built-in deny list.
    #[serde(default)]
    pub strip_env: Vec<String>,
}

/// Independent post-harvest verification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestVerification {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub command: String,
}

/// Orchestrator-level policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorPolicy {
    #[serde(default)]
    pub test_verification: TestVerification,
}

/// The full repo policy document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoPolicy {
    #[serde(default)]
    pub worker_adapters: AdapterPolicy,
    #[serde(default)]
    pub worker_runtime: RuntimePolicy,
    #[serde(default)]
    pub orchestrator: OrchestratorPolicy,
}

impl RepoPolicy {
    /// Load from `<repo_cwd>/.agentmesh/policy.json`. Absent or unreadable
    /// files yield the default policy.
    pub fn load(repo_cwd: &str) -> Self {
        if repo_cwd.is_empty() {
            return Self::default();
        }
        let path = Path::new(repo_cwd).join(".agentmesh").join("policy.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_json::from_str(&text) {
            Ok(policy) => policy,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "ignoring malformed policy file");
                Self::default()
            }
        }
    }
}

/// Resolve the independent verification command for a harvested task.
///
/// Priority: `task.meta.verify_tests_command`, then the repo policy's
/// `orchestrator.test_verification` when enabled. Empty means disabled.
pub fn verification_command(task_meta: &Value, repo_cwd: &str) -> String {
    if let Some(cmd) = task_meta.get("verify_tests_command").and_then(Value::as_str) {
        let cmd = cmd.trim();
        if !cmd.is_empty() {
            return cmd.to_owned();
        }
    }

    let policy = RepoPolicy::load(repo_cwd);
    let tv = &policy.orchestrator.test_verification;
    if tv.enabled && !tv.command.trim().is_empty() {
        return tv.command.trim().to_owned();
    }
    String::new()
}
