//! Persisted data model: swarm graphs, nodes, budgets, supervised tasks,
//! delivery-queue entries, and conversation history.
//!
//! All documents serialize as camelCase JSON, matching the files the relay
//! writes under `data/`.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a swarm graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SwarmStatus {
    /// True for the states a graph never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SwarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single node within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// True while the node occupies an in-flight slot or is about to.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Ready | Self::Queued | Self::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Kind of work a node performs; drives model selection and output handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Research,
    Code,
    Synthesize,
    Validate,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Research => "research",
            Self::Code => "code",
            Self::Synthesize => "synthesize",
            Self::Validate => "validate",
        };
        f.write_str(s)
    }
}

/// Status of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Kind of supervised task. Research children write an output file;
/// code children edit project files in their working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Code,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Research => "research",
            Self::Code => "code",
        })
    }
}

/// Model tier handed to the external agent via `--model`.
///
/// Ordered cheapest first; budget pressure walks down this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// The identifier passed on the agent command line.
    pub fn model_id(self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }

    pub fn cheapest() -> Self {
        Self::Haiku
    }

    /// The next cheaper tier, if any.
    pub fn next_cheaper(self) -> Option<Self> {
        match self {
            Self::Opus => Some(Self::Sonnet),
            Self::Sonnet => Some(Self::Haiku),
            Self::Haiku => None,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_id())
    }
}

impl FromStr for ModelTier {
    type Err = ModelTierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "haiku" => Ok(Self::Haiku),
            "sonnet" => Ok(Self::Sonnet),
            "opus" => Ok(Self::Opus),
            other => Err(ModelTierParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ModelTier`] string.
#[derive(Debug, Clone)]
pub struct ModelTierParseError(pub String);

impl fmt::Display for ModelTierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid model tier: {:?} (expected haiku, sonnet, or opus)", self.0)
    }
}

impl std::error::Error for ModelTierParseError {}

/// The first-tripped kill condition of a supervised task, or `completed`
/// when the child exited naturally before any clock fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    ToolLimit,
    Budget,
    WallClock,
    Inactivity,
    Error,
    Cancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::ToolLimit => "tool_limit",
            Self::Budget => "budget",
            Self::WallClock => "wall_clock",
            Self::Inactivity => "inactivity",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Author of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

/// Media kind of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Voice,
    Photo,
    Document,
}

// ---------------------------------------------------------------------------
// Swarm graph
// ---------------------------------------------------------------------------

/// Completion marker letting a restart skip an already-finished node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub completed_at: DateTime<Utc>,
    /// First 16 hex digits of the SHA-256 over the output bytes, or the
    /// sentinel `"empty"` for empty output. A display fingerprint, not a
    /// cryptographic identity.
    pub output_hash: String,
}

/// A single LLM invocation within a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub prompt: String,
    /// Explicit model override; `None` lets the router choose.
    #[serde(default)]
    pub model: Option<ModelTier>,
    /// Handle of the supervised task currently executing this node.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Scratchpad key: `<swarmId>/<nodeId>`.
    pub output_key: String,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub retries: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// When set, this node's failure does not cascade downstream.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub cost_usd: f64,
}

/// A strict dependency: `from` must reach a terminal-successful state
/// before `to` may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Cost, concurrency, and wall-clock ceilings for one graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetEnvelope {
    pub max_cost_usd: f64,
    #[serde(default)]
    pub spent_usd: f64,
    pub max_concurrent: usize,
    pub max_nodes: usize,
    pub max_wall_clock_secs: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl BudgetEnvelope {
    /// Remaining funds; negative once the terminating node's cost lands.
    pub fn remaining_usd(&self) -> f64 {
        self.max_cost_usd - self.spent_usd
    }
}

/// One user-level request decomposed into a DAG of LLM-backed work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmDag {
    /// Opaque but sortable by creation time.
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SwarmStatus,
    pub nodes: Vec<SwarmNode>,
    pub edges: Vec<SwarmEdge>,
    pub budget: BudgetEnvelope,
    pub initiator: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub final_result: Option<String>,
}

impl SwarmDag {
    pub fn node(&self, node_id: &str) -> Option<&SwarmNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut SwarmNode> {
        self.nodes.iter_mut().find(|n| n.id == node_id)
    }

    /// Ids of the nodes `node_id` depends on.
    pub fn predecessor_ids(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == node_id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Ids of the nodes depending on `node_id`.
    pub fn successor_ids(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == node_id)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Nodes currently holding (or about to hold) an in-flight slot.
    pub fn in_flight_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Queued | NodeStatus::Running))
            .count()
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}

/// Back-reference from a supervised task to the graph node it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmRef {
    pub swarm_id: String,
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Supervised tasks
// ---------------------------------------------------------------------------

/// The unit tracked by the supervisor; wraps exactly one child-process
/// lifetime plus its accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisedTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub result: Option<String>,
    pub requested_by: String,
    #[serde(default)]
    pub retries: u32,
    pub max_retries: u32,
    pub last_checked_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    /// OS pid of the live child; cleared on exit or cancellation.
    #[serde(default)]
    pub pid: Option<u32>,
    pub model: ModelTier,
    /// Kept so a timed-out research task can be respawned verbatim.
    #[serde(default)]
    pub prompt: Option<String>,
    pub kind: TaskKind,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub last_tool: Option<String>,
    #[serde(default)]
    pub last_file: Option<String>,
    /// First-tripped kill condition; never overwritten once set.
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    /// Set when this task executes a graph node.
    #[serde(default)]
    pub swarm: Option<SwarmRef>,
}

impl SupervisedTask {
    /// Seconds since the task (re)started, measured against `now`.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        let base = self.started_at.unwrap_or(self.created_at);
        (now - base).num_seconds().max(0) as u64
    }
}

/// The persisted live-task registry (`tasks.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRegistry {
    pub tasks: Vec<SupervisedTask>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    /// Lifetime counter per exit reason (keys are the snake_case names).
    pub exit_reasons: HashMap<String, u64>,
}

impl TaskRegistry {
    pub fn task(&self, id: &str) -> Option<&SupervisedTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut SupervisedTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Count of running tasks with a live child process.
    pub fn running_with_pid(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running && t.pid.is_some())
            .count()
    }

    pub fn record_exit(&mut self, reason: ExitReason) {
        *self.exit_reasons.entry(reason.to_string()).or_insert(0) += 1;
        match reason {
            ExitReason::Completed => self.total_completed += 1,
            ExitReason::WallClock | ExitReason::Inactivity => self.total_timed_out += 1,
            _ => self.total_failed += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery queue & conversations
// ---------------------------------------------------------------------------

/// One outbound reply awaiting delivery confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReply {
    pub id: String,
    pub chat_id: String,
    pub text: String,
    pub enqueued_at: DateTime<Utc>,
}

/// One entry in a session's conversation ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
}

/// Heartbeat rotation state (`heartbeat-state.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatState {
    pub sweep_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}
