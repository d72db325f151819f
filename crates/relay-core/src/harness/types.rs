//! Supporting types for the harness layer.

use std::path::PathBuf;

use relay_store::models::ModelTier;

/// Everything needed to launch one agent child process.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Supervised-task id this child executes.
    pub task_id: String,
    /// Full prompt, passed as a single argv element (never through a shell).
    pub prompt: String,
    pub model: ModelTier,
    pub working_dir: PathBuf,
}

/// Handle on a spawned agent process.
///
/// The harness retains ownership of the [`tokio::process::Child`]; the
/// handle is a cheap identifier the supervisor can clone into monitors.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub pid: u32,
    pub task_id: String,
    pub harness_name: String,
}

/// One parsed line of the child's stream-json output.
///
/// Unknown event types are dropped at the parse layer and never reach the
/// supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// An `assistant` event: one LLM-to-tool decision.
    ToolUse {
        tool: Option<String>,
        input: serde_json::Value,
    },
    /// A `result` event: the child's final (or intermediate) result record.
    Result {
        text: String,
        is_error: bool,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Stdout reached EOF; the child has exited or closed its pipe.
    Completed,
}
