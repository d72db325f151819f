//! Error kinds shared across the core.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// The executor converts per-node errors into failed-node state rather than
/// letting them cross tick boundaries; the supervisor converts per-task
/// errors into terminal task state. Only graph building, task registration,
/// and breaker admission hand these back to callers directly.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Distinguished so fallbacks can swallow it silently.
    #[error("circuit open for {service}: {last_error}")]
    CircuitOpen { service: String, last_error: String },

    #[error("budget exceeded: spent ${spent:.2} of ${max:.2}")]
    BudgetExceeded { spent: f64, max: f64 },

    #[error("wall clock exceeded: {elapsed_secs}s > {limit_secs}s")]
    WallClockExceeded { elapsed_secs: u64, limit_secs: u64 },

    #[error("tool call limit exceeded: {count} > {max}")]
    ToolLimitExceeded { count: u64, max: u64 },

    #[error("no activity for {idle_secs}s (limit {limit_secs}s)")]
    Inactivity { idle_secs: u64, limit_secs: u64 },

    #[error("failed to spawn agent: {0}")]
    SpawnFailure(String),

    #[error("agent exited with code {code}: {detail}")]
    ChildExit { code: i32, detail: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Persistence(#[from] relay_store::StoreError),
}
