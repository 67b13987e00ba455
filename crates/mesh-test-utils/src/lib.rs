//! Shared test utilities for mesh integration tests.
//!
//! Provides a fresh data directory with a migrated store, a disposable
//! git repository, and a scriptable worker adapter so spawn tests do not
//! need a real agent CLI on PATH.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use sqlx::SqlitePool;
use tempfile::TempDir;

use mesh_core::adapter::{SpawnSpec, WorkerAdapter, WorkerOutput};
use mesh_db::config::DataDir;
use mesh_db::pool::connect_and_migrate;

/// A fresh mesh data directory with the store migrated. The temp dir is
/// removed when this is dropped.
pub struct TestMesh {
    _tmp: TempDir,
    pub data_dir: DataDir,
    pub pool: SqlitePool,
}

impl TestMesh {
    /// Create a new, empty mesh in a temp dir.
    pub async fn new() -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let data_dir = DataDir::new(tmp.path());
        let pool = connect_and_migrate(&data_dir)
            .await
            .expect("failed to open store");
        Self {
            _tmp: tmp,
            data_dir,
            pool,
        }
    }
}

/// Create a temporary git repository with one initial commit. The
/// returned `TempDir` must be held alive for the repo's lifetime.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init"]);
    run(&["config", "user.email", "test@agentmesh.dev"]);
    run(&["config", "user.name", "Mesh Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("write README");
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// A worker adapter that runs an arbitrary shell script.
///
/// `{output}` in the script is replaced with the adapter's output path.
/// The output file is parsed as JSON; its `success` field (default true)
/// decides the worker outcome.
pub struct ScriptAdapter {
    pub backend: String,
    pub script: String,
}

impl ScriptAdapter {
    pub fn new(backend: &str, script: &str) -> Self {
        Self {
            backend: backend.to_owned(),
            script: script.to_owned(),
        }
    }
}

impl WorkerAdapter for ScriptAdapter {
    fn name(&self) -> &str {
        &self.backend
    }

    fn version(&self) -> &str {
        "test:0"
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn origin(&self) -> &'static str {
        file!()
    }

    fn build_spawn_spec(
        &self,
        _context: &str,
        _model: &str,
        _worktree_path: &Path,
        output_dir: &Path,
    ) -> SpawnSpec {
        let output_path = output_dir.join("worker_output.json");
        let script = self
            .script
            .replace("{output}", &output_path.to_string_lossy());
        SpawnSpec {
            command: vec!["sh".to_owned(), "-c".to_owned(), script],
            output_path,
            env: HashMap::new(),
            stdout_to_file: false,
        }
    }

    fn parse_output(&self, output_path: &Path) -> WorkerOutput {
        let Ok(content) = std::fs::read_to_string(output_path) else {
            return WorkerOutput {
                error_message: "output file missing".to_owned(),
                ..Default::default()
            };
        };
        match serde_json::from_str::<serde_json::Value>(content.trim()) {
            Ok(data) => {
                let success = data
                    .get("success")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                WorkerOutput::from_parts(success, data)
            }
            Err(err) => WorkerOutput {
                error_message: err.to_string(),
                ..Default::default()
            },
        }
    }
}
