//! Worker backend adapters and their registry.
//!
//! An adapter translates a task context into a subprocess invocation and
//! parses the worker's output file back into a structured result. Adapters
//! are registered at compile time; the registry resolves a backend name at
//! spawn time and the policy gate decides whether it may run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::policy::AdapterPolicy;

/// What to run: command, output path, extra env vars.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: Vec<String>,
    pub output_path: PathBuf,
    /// Extra environment for the child; wins over the sanitized parent env.
    pub env: HashMap<String, String>,
    /// Whether the spawner redirects child stdout into `output_path`.
    pub stdout_to_file: bool,
}

/// Structured output parsed from a finished worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    pub success: bool,
    pub raw: Value,
    pub cost_usd: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub error_message: String,
}

impl WorkerOutput {
    /// Normalize the loose `(success, object)` form some adapters produce:
    /// cost and token counts are lifted out of the raw object when present.
    pub fn from_parts(success: bool, raw: Value) -> Self {
        let obj = raw.as_object().cloned().unwrap_or_default();
        Self {
            success,
            cost_usd: obj.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
            tokens_in: obj
                .get("num_input_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            tokens_out: obj
                .get("num_output_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            error_message: obj
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
            raw,
        }
    }

    /// The fail-closed output used when a spawn's recorded backend is not
    /// registered in this process.
    pub fn unknown_backend(backend: &str) -> Self {
        Self {
            success: false,
            raw: serde_json::json!({"error": "unknown_backend", "backend": backend}),
            error_message: format!("unknown backend: {backend}"),
            ..Default::default()
        }
    }
}

/// Identity of a registered adapter, for receipts and policy checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub version: String,
    pub module: String,
    pub origin: String,
}

/// Adapter interface for worker backends.
///
/// Object-safe so implementations can be stored as `Box<dyn WorkerAdapter>`
/// in the [`AdapterRegistry`].
pub trait WorkerAdapter: Send + Sync {
    /// Backend name, e.g. `"claude_code"`.
    fn name(&self) -> &str;

    /// Version string recorded on every spawn.
    fn version(&self) -> &str;

    /// Rust module path of the implementation (`module_path!()`).
    fn module(&self) -> &'static str;

    /// Source file of the implementation (`file!()`), for path policy.
    fn origin(&self) -> &'static str;

    /// Build the subprocess invocation for one worker run.
    fn build_spawn_spec(
        &self,
        context: &str,
        model: &str,
        worktree_path: &Path,
        output_dir: &Path,
    ) -> SpawnSpec;

    /// Parse the worker's output file. Never panics; parse failures come
    /// back as `success = false` with an error message.
    fn parse_output(&self, output_path: &Path) -> WorkerOutput;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn WorkerAdapter) {}
};

impl std::fmt::Debug for dyn WorkerAdapter + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAdapter").field("name", &self.name()).finish()
    }
}

/// Errors from adapter resolution and policy.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown worker backend {0:?}; registered: {1}")]
    Unknown(String, String),
    #[error("backend {backend:?} denied by policy: {reason}")]
    PolicyDenied { backend: String, reason: String },
}

/// Default adapter: the Claude Code CLI in headless print mode.
#[derive(Debug, Default)]
pub struct ClaudeCodeAdapter;

impl WorkerAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude_code"
    }

    fn version(&self) -> &str {
        concat!("agentmesh:", env!("CARGO_PKG_VERSION"))
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn origin(&self) -> &'static str {
        file!()
    }

    fn build_spawn_spec(
        &self,
        context: &str,
        model: &str,
        _worktree_path: &Path,
        output_dir: &Path,
    ) -> SpawnSpec {
        SpawnSpec {
            command: vec![
                "claude".to_owned(),
                "--print".to_owned(),
                "--output-format".to_owned(),
                "json".to_owned(),
                "--model".to_owned(),
                model.to_owned(),
                "--dangerously-skip-permissions".to_owned(),
                context.to_owned(),
            ],
            output_path: output_dir.join("claude_output.json"),
            env: HashMap::new(),
            stdout_to_file: true,
        }
    }

    fn parse_output(&self, output_path: &Path) -> WorkerOutput {
        let content = match std::fs::read_to_string(output_path) {
            Ok(content) => content,
            Err(_) => {
                return WorkerOutput {
                    error_message: "output file missing".to_owned(),
                    ..Default::default()
                };
            }
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return WorkerOutput {
                error_message: "output file empty".to_owned(),
                ..Default::default()
            };
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(data) => {
                let mut out = WorkerOutput::from_parts(true, data);
                out.error_message = String::new();
                out
            }
            Err(err) => WorkerOutput {
                error_message: err.to_string(),
                ..Default::default()
            },
        }
    }
}

/// Named collection of registered adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn WorkerAdapter>>,
    load_errors: Vec<String>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with all built-in adapters, after the environment
    /// autoload check.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ClaudeCodeAdapter);
        registry.autoload_from_env();
        registry
    }

    /// Register an adapter under its own name. Replaces and returns any
    /// previous adapter with that name.
    pub fn register(&mut self, adapter: impl WorkerAdapter + 'static) -> Option<Box<dyn WorkerAdapter>> {
        let name = adapter.name().to_owned();
        self.adapters.insert(name, Box::new(adapter))
    }

    /// Look up an adapter by backend name.
    pub fn get(&self, name: &str) -> Result<&dyn WorkerAdapter, AdapterError> {
        self.adapters
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| AdapterError::Unknown(name.to_owned(), self.known_names()))
    }

    /// Identity of a registered adapter.
    pub fn describe(&self, name: &str) -> Result<AdapterInfo, AdapterError> {
        let adapter = self.get(name)?;
        Ok(AdapterInfo {
            name: adapter.name().to_owned(),
            version: adapter.version().to_owned(),
            module: adapter.module().to_owned(),
            origin: adapter.origin().to_owned(),
        })
    }

    /// Sorted backend names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Errors captured while loading adapters; never thrown.
    pub fn load_errors(&self) -> &[String] {
        &self.load_errors
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapters are registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Environment-driven adapter loading.
    ///
    /// Adapters are compiled in, so this is a recorded no-op: a truthy CI
    /// indicator disables the mechanism outright, and a populated module
    /// list is noted as unsupported rather than failing startup.
    pub fn autoload_from_env(&mut self) {
        const ENV_VAR: &str = "AGENTMESH_ADAPTER_MODULES";
        if ci_truthy() {
            self.load_errors.push(format!("{ENV_VAR}: disabled in CI"));
            return;
        }
        if let Ok(raw) = std::env::var(ENV_VAR) {
            if !raw.trim().is_empty() {
                self.load_errors.push(format!(
                    "{ENV_VAR}: dynamic adapter modules are not supported; \
                     register adapters at build time"
                ));
            }
        }
    }

    fn known_names(&self) -> String {
        let names = self.list();
        if names.is_empty() {
            "(none)".to_owned()
        } else {
            names.join(", ")
        }
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .field("load_errors", &self.load_errors)
            .finish()
    }
}

fn ci_truthy() -> bool {
    match std::env::var("CI") {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Fail-closed adapter policy gate, evaluated at spawn time.
///
/// Empty allow-lists impose no restriction. Under `allow_paths`, an
/// adapter with an unknown origin is denied.
pub fn enforce_adapter_policy(
    registry: &AdapterRegistry,
    backend: &str,
    repo_cwd: &str,
    policy: &AdapterPolicy,
) -> Result<(), AdapterError> {
    let info = registry.describe(backend)?;

    if !policy.allow_backends.is_empty() && !policy.allow_backends.iter().any(|b| b == backend) {
        return Err(AdapterError::PolicyDenied {
            backend: backend.to_owned(),
            reason: "not in allow_backends".to_owned(),
        });
    }

    if !policy.allow_modules.is_empty() && !policy.allow_modules.iter().any(|m| *m == info.module)
    {
        return Err(AdapterError::PolicyDenied {
            backend: backend.to_owned(),
            reason: format!("module {:?} not in allow_modules", info.module),
        });
    }

    if !policy.allow_paths.is_empty() {
        if info.origin.is_empty() {
            return Err(AdapterError::PolicyDenied {
                backend: backend.to_owned(),
                reason: "unknown origin path under allow_paths policy".to_owned(),
            });
        }
        let origin = resolve_path(Path::new(&info.origin), repo_cwd);
        let allowed = policy.allow_paths.iter().any(|raw| {
            let base = resolve_path(Path::new(raw), repo_cwd);
            origin.starts_with(&base)
        });
        if !allowed {
            return Err(AdapterError::PolicyDenied {
                backend: backend.to_owned(),
                reason: format!("origin {:?} not under allow_paths", info.origin),
            });
        }
    }

    Ok(())
}

fn resolve_path(path: &Path, repo_cwd: &str) -> PathBuf {
    let joined = if path.is_absolute() || repo_cwd.is_empty() {
        path.to_path_buf()
    } else {
        Path::new(repo_cwd).join(path)
    };
    joined.canonicalize().unwrap_or(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Minimal test adapter.
    struct FakeAdapter {
        backend_name: String,
    }

    impl FakeAdapter {
        fn new(name: &str) -> Self {
            Self {
                backend_name: name.to_owned(),
            }
        }
    }

    impl WorkerAdapter for FakeAdapter {
        fn name(&self) -> &str {
            &self.backend_name
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
            SpawnSpec {
                command: vec!["true".to_owned()],
                output_path: output_dir.join("out.json"),
                env: HashMap::new(),
                stdout_to_file: false,
            }
        }

        fn parse_output(&self, _output_path: &Path) -> WorkerOutput {
            WorkerOutput::from_parts(true, json!({}))
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = AdapterRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.register(FakeAdapter::new("alpha")).is_none());
        assert_eq!(registry.get("alpha").unwrap().name(), "alpha");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = AdapterRegistry::new();
        registry.register(FakeAdapter::new("alpha"));
        let old = registry.register(FakeAdapter::new("alpha"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_backend_lists_known() {
        let mut registry = AdapterRegistry::new();
        registry.register(FakeAdapter::new("alpha"));
        let err = registry.get("missing").unwrap_err();
        assert!(err.to_string().contains("alpha"), "{err}");
    }

    #[test]
    fn builtins_include_claude_code() {
        let registry = AdapterRegistry::with_builtins();
        assert!(registry.list().contains(&"claude_code"));
        let info = registry.describe("claude_code").unwrap();
        assert!(info.version.starts_with("agentmesh:"));
        assert!(!info.module.is_empty());
    }

    #[test]
    fn claude_spec_shape() {
        let adapter = ClaudeCodeAdapter;
        let spec = adapter.build_spawn_spec(
            "Task: x\n",
            "sonnet",
            Path::new("/tmp/wt"),
            Path::new("/tmp/wt/.agentmesh"),
        );
        assert_eq!(spec.command[0], "claude");
        assert!(spec.command.contains(&"--model".to_owned()));
        assert!(spec.stdout_to_file);
        assert!(spec.output_path.ends_with("claude_output.json"));
    }

    #[test]
    fn claude_parse_missing_and_empty_and_valid() {
        let adapter = ClaudeCodeAdapter;
        let dir = TempDir::new().unwrap();

        let missing = adapter.parse_output(&dir.path().join("absent.json"));
        assert!(!missing.success);
        assert_eq!(missing.error_message, "output file missing");

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "  \n").unwrap();
        let out = adapter.parse_output(&empty);
        assert!(!out.success);
        assert_eq!(out.error_message, "output file empty");

        let good = dir.path().join("good.json");
        std::fs::write(
            &good,
            r#"{"cost_usd": 0.25, "num_input_tokens": 100, "num_output_tokens": 50}"#,
        )
        .unwrap();
        let out = adapter.parse_output(&good);
        assert!(out.success);
        assert!((out.cost_usd - 0.25).abs() < f64::EPSILON);
        assert_eq!(out.tokens_in, 100);
        assert_eq!(out.tokens_out, 50);
    }

    #[test]
    fn from_parts_normalizes_tuple_form() {
        let out = WorkerOutput::from_parts(
            false,
            json!({"cost_usd": 1.5, "num_input_tokens": 10, "error": "boom"}),
        );
        assert!(!out.success);
        assert!((out.cost_usd - 1.5).abs() < f64::EPSILON);
        assert_eq!(out.tokens_in, 10);
        assert_eq!(out.error_message, "boom");
    }

    #[test]
    fn policy_empty_lists_allow_everything() {
        let registry = AdapterRegistry::with_builtins();
        let policy = AdapterPolicy::default();
        enforce_adapter_policy(&registry, "claude_code", "", &policy).unwrap();
    }

    #[test]
    fn policy_backend_allow_list() {
        let registry = AdapterRegistry::with_builtins();
        let policy = AdapterPolicy {
            allow_backends: vec!["other".to_owned()],
            ..Default::default()
        };
        let err = enforce_adapter_policy(&registry, "claude_code", "", &policy).unwrap_err();
        assert!(matches!(err, AdapterError::PolicyDenied { .. }));
    }

    #[test]
    fn policy_module_allow_list() {
        let registry = AdapterRegistry::with_builtins();
        let info = registry.describe("claude_code").unwrap();

        let allowing = AdapterPolicy {
            allow_modules: vec![info.module.clone()],
            ..Default::default()
        };
        enforce_adapter_policy(&registry, "claude_code", "", &allowing).unwrap();

        let denying = AdapterPolicy {
            allow_modules: vec!["some::other::module".to_owned()],
            ..Default::default()
        };
        assert!(enforce_adapter_policy(&registry, "claude_code", "", &denying).is_err());
    }

    #[test]
    fn policy_path_allow_list() {
        let registry = AdapterRegistry::with_builtins();
        let info = registry.describe("claude_code").unwrap();
        let origin_dir = Path::new(&info.origin)
            .parent()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        let allowing = AdapterPolicy {
            allow_paths: vec![origin_dir],
            ..Default::default()
        };
        enforce_adapter_policy(&registry, "claude_code", "", &allowing).unwrap();

        let denying = AdapterPolicy {
            allow_paths: vec!["/nonexistent/prefix".to_owned()],
            ..Default::default()
        };
        assert!(enforce_adapter_policy(&registry, "claude_code", "", &denying).is_err());
    }

    #[test]
    fn unknown_backend_output_is_fail_closed() {
        let out = WorkerOutput::unknown_backend("mystery");
        assert!(!out.success);
        assert_eq!(out.raw["error"], "unknown_backend");
        assert_eq!(out.raw["backend"], "mystery");
    }
}
