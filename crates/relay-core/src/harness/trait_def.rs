//! The `AgentHarness` trait -- the seam between the supervisor and the
//! concrete agent CLI.
//!
//! Object-safe so the supervisor can hold `Arc<dyn AgentHarness>` and tests
//! can substitute scripted fakes for the real binary.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use super::types::{AgentCommand, AgentEvent, AgentHandle};

/// What became of a child after termination or natural exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, or `None` when the child ignored its signal within the
    /// grace period and was leaked to the OS.
    pub code: Option<i32>,
    /// Whatever the child wrote to stderr, for diagnostics.
    pub stderr: String,
}

/// Adapter interface for spawning and managing agent child processes.
#[async_trait]
pub trait AgentHarness: Send + Sync {
    /// Human-readable name for this harness (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Spawn an agent process. The prompt must be passed as its own argv
    /// element; the working directory and inherited environment come from
    /// `cmd`.
    async fn spawn(&self, cmd: &AgentCommand) -> Result<AgentHandle>;

    /// Stream of parsed events from the child's stdout. Yields
    /// [`AgentEvent::Completed`] once at EOF, then terminates.
    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

    /// Send the platform termination signal exactly once. Repeated calls
    /// for the same handle are no-ops; no second signal is ever sent.
    async fn terminate(&self, handle: &AgentHandle) -> Result<()>;

    /// Wait up to `grace` for the child to exit, draining stderr for
    /// diagnostics. A child that outlives the grace period is leaked to the
    /// OS and reported with `code: None`.
    async fn wait(&self, handle: &AgentHandle, grace: Duration) -> ExitOutcome;

    /// Whether the child process is still alive.
    async fn is_running(&self, handle: &AgentHandle) -> bool;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentHarness) {}
};
