use std::env;
use std::path::{Path, PathBuf};

/// The data directory holding the store, the event log, and episode state.
///
/// Resolution order: explicit path, then the `AGENTMESH_DATA_DIR`
/// environment variable, then `~/.agentmesh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Environment variable that overrides the default location.
    pub const ENV_VAR: &str = "AGENTMESH_DATA_DIR";

    /// Build a data dir at an explicit root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from the environment, falling back to `~/.agentmesh`.
    pub fn from_env() -> Self {
        if let Ok(dir) = env::var(Self::ENV_VAR) {
            if !dir.trim().is_empty() {
                return Self::new(dir);
            }
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".agentmesh"))
    }

    /// Resolve from an optional CLI override, else the environment.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        match explicit {
            Some(p) => Self::new(p),
            None => Self::from_env(),
        }
    }

    /// The directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the SQLite store.
    pub fn board_db(&self) -> PathBuf {
        self.root.join("board.db")
    }

    /// Path to the JSONL event log.
    pub fn events_file(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    /// Path to the single-line current-episode marker.
    pub fn current_episode_file(&self) -> PathBuf {
        self.root.join("current_episode")
    }

    /// Path to the bundle output directory.
    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join("bundles")
    }

    /// Create the directory tree if it does not exist.
    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
