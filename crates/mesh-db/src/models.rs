use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Current UTC time as an RFC3339 string with microsecond precision.
///
/// All persisted timestamps use this format so that lexical comparison of
/// two timestamps is also chronological comparison.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The timestamp `seconds` into the future, formatted like [`now_ts`].
pub fn now_plus_secs(seconds: i64) -> String {
    (Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The timestamp `seconds` in the past, formatted like [`now_ts`].
pub fn now_minus_secs(seconds: i64) -> String {
    (Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Generate a prefixed row id, e.g. `task_3f9a1c0b2d4e`.
pub fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..12])
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of participating agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Custom,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClaudeCode => "claude_code",
            Self::Codex => "codex",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = AgentKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "custom" => Ok(Self::Custom),
            other => Err(AgentKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentKind`] string.
#[derive(Debug, Clone)]
pub struct AgentKindParseError(pub String);

impl fmt::Display for AgentKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent kind: {:?}", self.0)
    }
}

impl std::error::Error for AgentKindParseError {}

// ---------------------------------------------------------------------------

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Blocked,
    Gone,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Blocked => "blocked",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "blocked" => Ok(Self::Blocked),
            "gone" => Ok(Self::Gone),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of resource a claim asserts intent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Port,
    Lock,
    TestSuite,
    TempDir,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::File => "file",
            Self::Port => "port",
            Self::Lock => "lock",
            Self::TestSuite => "test_suite",
            Self::TempDir => "temp_dir",
        };
        f.write_str(s)
    }
}

impl FromStr for ResourceType {
    type Err = ResourceTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "port" => Ok(Self::Port),
            "lock" => Ok(Self::Lock),
            "test_suite" => Ok(Self::TestSuite),
            "temp_dir" => Ok(Self::TempDir),
            other => Err(ResourceTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ResourceType`] string.
#[derive(Debug, Clone)]
pub struct ResourceTypeParseError(pub String);

impl fmt::Display for ResourceTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid resource type: {:?}", self.0)
    }
}

impl std::error::Error for ResourceTypeParseError {}

// ---------------------------------------------------------------------------

/// What the claiming agent intends to do with the resource.
///
/// Only `edit` claims are mutually exclusive; the other intents coexist
/// freely with anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClaimIntent {
    Edit,
    Read,
    Test,
    Review,
}

impl fmt::Display for ClaimIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Edit => "edit",
            Self::Read => "read",
            Self::Test => "test",
            Self::Review => "review",
        };
        f.write_str(s)
    }
}

impl FromStr for ClaimIntent {
    type Err = ClaimIntentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edit" => Ok(Self::Edit),
            "read" => Ok(Self::Read),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            other => Err(ClaimIntentParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ClaimIntent`] string.
#[derive(Debug, Clone)]
pub struct ClaimIntentParseError(pub String);

impl fmt::Display for ClaimIntentParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid claim intent: {:?}", self.0)
    }
}

impl std::error::Error for ClaimIntentParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Active,
    Released,
    Expired,
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ClaimState {
    type Err = ClaimStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            other => Err(ClaimStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ClaimState`] string.
#[derive(Debug, Clone)]
pub struct ClaimStateParseError(pub String);

impl fmt::Display for ClaimStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid claim state: {:?}", self.0)
    }
}

impl std::error::Error for ClaimStateParseError {}

// ---------------------------------------------------------------------------

/// State of a task in the fixed lifecycle DAG.
///
/// `Merged` and `Aborted` are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Planned,
    Assigned,
    Running,
    PrOpen,
    CiPass,
    ReviewPass,
    Merged,
    Aborted,
}

impl TaskState {
    /// Whether this state has no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Aborted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::PrOpen => "pr_open",
            Self::CiPass => "ci_pass",
            Self::ReviewPass => "review_pass",
            Self::Merged => "merged",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "pr_open" => Ok(Self::PrOpen),
            "ci_pass" => Ok(Self::CiPass),
            "review_pass" => Ok(Self::ReviewPass),
            "merged" => Ok(Self::Merged),
            "aborted" => Ok(Self::Aborted),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// Closed set of operational event kinds carried in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Register,
    Deregister,
    Heartbeat,
    Claim,
    Release,
    Expire,
    Msg,
    Bundle,
    Gc,
    SoftConflict,
    EpisodeStart,
    EpisodeEnd,
    Wait,
    Steal,
    Commit,
    TaskTransition,
    WorkerSpawn,
    WorkerDone,
    AdapterLoad,
    OrchFreeze,
    OrchLockMerges,
    OrchAbortAll,
    OrchLeaseRenew,
    CostExceeded,
    TestMismatch,
    AssayReceipt,
    WeaveChainBreak,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Register => "REGISTER",
            Self::Deregister => "DEREGISTER",
            Self::Heartbeat => "HEARTBEAT",
            Self::Claim => "CLAIM",
            Self::Release => "RELEASE",
            Self::Expire => "EXPIRE",
            Self::Msg => "MSG",
            Self::Bundle => "BUNDLE",
            Self::Gc => "GC",
            Self::SoftConflict => "SOFT_CONFLICT",
            Self::EpisodeStart => "EPISODE_START",
            Self::EpisodeEnd => "EPISODE_END",
            Self::Wait => "WAIT",
            Self::Steal => "STEAL",
            Self::Commit => "COMMIT",
            Self::TaskTransition => "TASK_TRANSITION",
            Self::WorkerSpawn => "WORKER_SPAWN",
            Self::WorkerDone => "WORKER_DONE",
            Self::AdapterLoad => "ADAPTER_LOAD",
            Self::OrchFreeze => "ORCH_FREEZE",
            Self::OrchLockMerges => "ORCH_LOCK_MERGES",
            Self::OrchAbortAll => "ORCH_ABORT_ALL",
            Self::OrchLeaseRenew => "ORCH_LEASE_RENEW",
            Self::CostExceeded => "COST_EXCEEDED",
            Self::TestMismatch => "TEST_MISMATCH",
            Self::AssayReceipt => "ASSAY_RECEIPT",
            Self::WeaveChainBreak => "WEAVE_CHAIN_BREAK",
        };
        f.write_str(s)
    }
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTER" => Ok(Self::Register),
            "DEREGISTER" => Ok(Self::Deregister),
            "HEARTBEAT" => Ok(Self::Heartbeat),
            "CLAIM" => Ok(Self::Claim),
            "RELEASE" => Ok(Self::Release),
            "EXPIRE" => Ok(Self::Expire),
            "MSG" => Ok(Self::Msg),
            "BUNDLE" => Ok(Self::Bundle),
            "GC" => Ok(Self::Gc),
            "SOFT_CONFLICT" => Ok(Self::SoftConflict),
            "EPISODE_START" => Ok(Self::EpisodeStart),
            "EPISODE_END" => Ok(Self::EpisodeEnd),
            "WAIT" => Ok(Self::Wait),
            "STEAL" => Ok(Self::Steal),
            "COMMIT" => Ok(Self::Commit),
            "TASK_TRANSITION" => Ok(Self::TaskTransition),
            "WORKER_SPAWN" => Ok(Self::WorkerSpawn),
            "WORKER_DONE" => Ok(Self::WorkerDone),
            "ADAPTER_LOAD" => Ok(Self::AdapterLoad),
            "ORCH_FREEZE" => Ok(Self::OrchFreeze),
            "ORCH_LOCK_MERGES" => Ok(Self::OrchLockMerges),
            "ORCH_ABORT_ALL" => Ok(Self::OrchAbortAll),
            "ORCH_LEASE_RENEW" => Ok(Self::OrchLeaseRenew),
            "COST_EXCEEDED" => Ok(Self::CostExceeded),
            "TEST_MISMATCH" => Ok(Self::TestMismatch),
            "ASSAY_RECEIPT" => Ok(Self::AssayReceipt),
            "WEAVE_CHAIN_BREAK" => Ok(Self::WeaveChainBreak),
            other => Err(EventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventKind`] string.
#[derive(Debug, Clone)]
pub struct EventKindParseError(pub String);

impl fmt::Display for EventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind: {:?}", self.0)
    }
}

impl std::error::Error for EventKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A participant registered with the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub agent_id: String,
    pub kind: AgentKind,
    pub display_name: String,
    pub cwd: String,
    pub pid: Option<i64>,
    pub status: AgentStatus,
    pub registered_at: String,
    pub last_heartbeat: String,
}

impl Agent {
    /// Build a new idle agent with fresh timestamps.
    pub fn new(agent_id: impl Into<String>, cwd: impl Into<String>) -> Self {
        let now = now_ts();
        Self {
            agent_id: agent_id.into(),
            kind: AgentKind::ClaudeCode,
            display_name: String::new(),
            cwd: cwd.into(),
            pid: None,
            status: AgentStatus::Idle,
            registered_at: now.clone(),
            last_heartbeat: now,
        }
    }
}

/// An assertion of exclusive intent on a resource.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Claim {
    pub claim_id: String,
    pub agent_id: String,
    pub resource_type: ResourceType,
    pub path: String,
    pub intent: ClaimIntent,
    pub state: ClaimState,
    pub ttl_s: i64,
    pub created_at: String,
    pub expires_at: String,
    pub released_at: String,
    pub reason: String,
    pub episode_id: String,
    pub priority: i64,
    pub effective_priority: i64,
}

/// A recorded interest in a currently-claimed resource.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Waiter {
    pub waiter_id: String,
    pub resource_type: ResourceType,
    pub path: String,
    pub waiter_agent_id: String,
    pub episode_id: String,
    pub priority: i64,
    pub reason: String,
    pub created_at: String,
}

/// A tracked unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub state: TaskState,
    pub assigned_agent_id: String,
    pub episode_id: String,
    pub branch: String,
    pub pr_url: String,
    pub parent_task_id: String,
    pub meta: Json<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// One agent's try at a task.
///
/// `ended_at` and `outcome` are empty until the attempt finishes; they are
/// set together.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attempt {
    pub attempt_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub attempt_number: i64,
    pub started_at: String,
    pub ended_at: String,
    pub outcome: String,
    pub error_summary: String,
}

/// A recorded worker subprocess tied to an attempt.
///
/// The `(ended_at, outcome)` pair is written exactly once, through the
/// finalization CAS; both are empty while the spawn is live.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Spawn {
    pub spawn_id: String,
    pub task_id: String,
    pub attempt_id: String,
    pub agent_id: String,
    pub pid: i64,
    pub pid_started_at: f64,
    pub worktree_path: String,
    pub branch: String,
    pub episode_id: String,
    pub context_hash: String,
    pub started_at: String,
    pub ended_at: String,
    pub outcome: String,
    pub output_path: String,
    pub repo_cwd: String,
    pub timeout_s: i64,
    pub backend: String,
    pub backend_version: String,
}

/// One record of the hash-chained provenance ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WeaveEvent {
    pub event_id: String,
    pub sequence_id: i64,
    pub episode_id: String,
    pub prev_hash: String,
    pub capsule_id: String,
    pub git_commit_sha: String,
    pub git_patch_hash: String,
    pub affected_symbols: Json<Vec<String>>,
    pub trace_id: String,
    pub parent_event_id: String,
    pub event_hash: String,
    pub created_at: String,
}

/// A lexicographically sortable grouping of related work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Episode {
    pub episode_id: String,
    pub title: String,
    pub started_at: String,
    pub ended_at: String,
    pub parent_episode_id: String,
}
