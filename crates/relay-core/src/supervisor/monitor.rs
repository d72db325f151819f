//! Per-child stream monitor.
//!
//! One monitor task runs per live child: it consumes the parsed event
//! stream, updates live counters, and applies the kill conditions --
//! tool_limit, budget, wall_clock (via the 5-second watchdog), and
//! inactivity. The first condition to trip wins and is recorded as the
//! task's exit reason; natural exit maps to `completed` or `error`.

use std::sync::Arc;

use futures::StreamExt;
use relay_store::models::{ExitReason, TaskKind, TaskStatus};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ProgressUpdate, TaskSupervisor};
use crate::harness::{AgentEvent, AgentHandle};
use crate::pricing::stream_cost;

/// Extract a candidate file path from a tool invocation.
///
/// Prefers the `file_path` / `path` keys of the tool input. For `Bash`, the
/// command string is scanned right-to-left for the last token that looks
/// like a path (contains `/`, `\` or `.`).
pub fn extract_file_path(tool: Option<&str>, input: &serde_json::Value) -> Option<String> {
    for key in ["file_path", "path"] {
        if let Some(path) = input.get(key).and_then(|v| v.as_str()) {
            return Some(path.to_owned());
        }
    }

    if tool == Some("Bash") {
        let command = input.get("command").and_then(|v| v.as_str())?;
        return command
            .split_whitespace()
            .rev()
            .find(|token| token.contains('/') || token.contains('\\') || token.contains('.'))
            .map(str::to_owned);
    }

    None
}

impl TaskSupervisor {
    /// Record one `assistant` event. Returns the updated counters for
    /// limit checks.
    async fn record_tool_use(
        &self,
        task_id: &str,
        tool: Option<String>,
        file: Option<String>,
    ) -> (u64, f64, Option<String>) {
        let counters = {
            let mut registry = self.registry.lock().await;
            let Some(task) = registry.task_mut(task_id) else {
                return (0, 0.0, None);
            };
            task.tool_calls += 1;
            if tool.is_some() {
                task.last_tool = tool;
            }
            if file.is_some() {
                task.last_file = file;
            }
            (task.tool_calls, task.cost_usd, task.last_file.clone())
        };
        self.persist_registry().await;
        counters
    }

    /// Record one `result` event's token usage. Returns the accumulated
    /// task cost.
    async fn record_result(&self, task_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let total = {
            let mut registry = self.registry.lock().await;
            let Some(task) = registry.task_mut(task_id) else {
                return 0.0;
            };
            task.cost_usd += stream_cost(task.model, input_tokens, output_tokens);
            task.cost_usd
        };
        self.persist_registry().await;
        total
    }

    async fn send_progress(&self, update: ProgressUpdate) {
        let progress = self.progress.lock().await.clone();
        if let Some(progress) = progress {
            progress(update);
        }
    }
}

/// Drive one child to a terminal task state.
pub(super) async fn run_monitor(
    supervisor: Arc<TaskSupervisor>,
    handle: AgentHandle,
    cancel: CancellationToken,
) {
    let task_id = handle.task_id.clone();
    let Some(task) = supervisor.get(&task_id).await else {
        return;
    };

    let config = supervisor.config().clone();
    let tool_limit = match task.kind {
        TaskKind::Code => config.code_max_tool_calls,
        TaskKind::Research => config.max_tool_calls,
    };
    // Research wall clocks belong to the output-polling sweep, which can
    // respawn; the watchdog only enforces them for streaming-only tasks.
    let watchdog_wall_clock = task.output_file.is_none();
    let timeout_secs = task.timeout_secs;

    let mut events = supervisor.harness.events(&handle);
    let mut watchdog = tokio::time::interval(config.watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let started = Instant::now();
    let mut last_activity = Instant::now();
    let mut last_progress = Instant::now();
    let mut saw_error_result = false;
    let mut final_text: Option<String> = None;
    let mut kill: Option<(ExitReason, String)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // cancel()/stop_child finalizes and reaps; nothing left here.
                debug!(task_id = %task_id, "monitor cancelled");
                return;
            }
            maybe_event = events.next() => {
                match maybe_event {
                    Some(AgentEvent::ToolUse { tool, input }) => {
                        last_activity = Instant::now();
                        let file = extract_file_path(tool.as_deref(), &input);
                        let (count, cost, last_file) = supervisor
                            .record_tool_use(&task_id, tool.clone(), file)
                            .await;

                        if count > tool_limit {
                            kill = Some((
                                ExitReason::ToolLimit,
                                format!("tool calls {count} exceeded limit {tool_limit}"),
                            ));
                        } else if last_progress.elapsed() >= config.progress_interval {
                            last_progress = Instant::now();
                            supervisor
                                .send_progress(ProgressUpdate {
                                    task_id: task_id.clone(),
                                    tool,
                                    tool_calls: count,
                                    elapsed_secs: started.elapsed().as_secs(),
                                    last_file,
                                    cost_usd: cost,
                                })
                                .await;
                        }
                    }
                    Some(AgentEvent::Result { text, is_error, input_tokens, output_tokens }) => {
                        last_activity = Instant::now();
                        let total = supervisor
                            .record_result(&task_id, input_tokens, output_tokens)
                            .await;
                        if is_error {
                            saw_error_result = true;
                        }
                        if !text.is_empty() {
                            final_text = Some(text);
                        }
                        if total > config.max_cost_usd {
                            kill = Some((
                                ExitReason::Budget,
                                format!(
                                    "cost ${total:.2} exceeded ceiling ${:.2}",
                                    config.max_cost_usd
                                ),
                            ));
                        }
                    }
                    Some(AgentEvent::Completed) | None => break,
                }
            }
            _ = watchdog.tick() => {
                let elapsed = started.elapsed().as_secs();
                let idle = last_activity.elapsed().as_secs();
                if watchdog_wall_clock && elapsed > timeout_secs {
                    kill = Some((
                        ExitReason::WallClock,
                        format!("wall clock {elapsed}s exceeded limit {timeout_secs}s"),
                    ));
                } else if idle > config.inactivity_timeout_secs {
                    kill = Some((
                        ExitReason::Inactivity,
                        format!(
                            "no activity for {idle}s (limit {}s)",
                            config.inactivity_timeout_secs
                        ),
                    ));
                }
            }
        }

        if kill.is_some() {
            break;
        }
    }

    match kill {
        Some((reason, detail)) => {
            // One termination signal; a child that ignores it is leaked.
            let _ = supervisor.harness.terminate(&handle).await;
            let outcome = supervisor.harness.wait(&handle, config.exit_grace).await;
            let error = if outcome.stderr.trim().is_empty() {
                detail
            } else {
                format!("{detail}; stderr: {}", trim_stderr(&outcome.stderr))
            };
            let status = match reason {
                ExitReason::WallClock | ExitReason::Inactivity => TaskStatus::Timeout,
                _ => TaskStatus::Failed,
            };
            supervisor
                .finalize(&task_id, status, reason, None, Some(error))
                .await;
        }
        None => {
            let outcome = supervisor.harness.wait(&handle, config.exit_grace).await;
            if outcome.code == Some(0) && !saw_error_result {
                supervisor
                    .finalize(
                        &task_id,
                        TaskStatus::Completed,
                        ExitReason::Completed,
                        final_text,
                        None,
                    )
                    .await;
            } else {
                let code = outcome.code.unwrap_or(-1);
                let error = if outcome.stderr.trim().is_empty() {
                    format!("agent exited with code {code}")
                } else {
                    format!(
                        "agent exited with code {code}: {}",
                        trim_stderr(&outcome.stderr)
                    )
                };
                supervisor
                    .finalize(&task_id, TaskStatus::Failed, ExitReason::Error, final_text, Some(error))
                    .await;
            }
        }
    }
}

/// Keep stderr diagnostics to a sane size for the task record.
fn trim_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.chars().count() <= 500 {
        trimmed.to_owned()
    } else {
        trimmed.chars().take(500).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_file_path_key() {
        let input = json!({"file_path": "/src/lib.rs", "command": "cat /other"});
        assert_eq!(
            extract_file_path(Some("Read"), &input).as_deref(),
            Some("/src/lib.rs")
        );
    }

    #[test]
    fn falls_back_to_path_key() {
        let input = json!({"path": "notes/todo.md"});
        assert_eq!(
            extract_file_path(Some("Glob"), &input).as_deref(),
            Some("notes/todo.md")
        );
    }

    #[test]
    fn bash_scans_command_right_to_left() {
        let input = json!({"command": "grep -rn pattern src/main.rs tests/e2e.rs"});
        assert_eq!(
            extract_file_path(Some("Bash"), &input).as_deref(),
            Some("tests/e2e.rs")
        );
    }

    #[test]
    fn bash_matches_dots_and_backslashes() {
        let input = json!({"command": "python setup.py"});
        assert_eq!(
            extract_file_path(Some("Bash"), &input).as_deref(),
            Some("setup.py")
        );
        let input = json!({"command": "type C:\\logs\\out"});
        assert_eq!(
            extract_file_path(Some("Bash"), &input).as_deref(),
            Some("C:\\logs\\out")
        );
    }

    #[test]
    fn bash_without_pathlike_token_is_none() {
        let input = json!({"command": "echo hello world"});
        assert_eq!(extract_file_path(Some("Bash"), &input), None);
    }

    #[test]
    fn non_bash_without_keys_is_none() {
        let input = json!({"query": "something"});
        assert_eq!(extract_file_path(Some("Search"), &input), None);
    }

    #[test]
    fn stderr_is_bounded() {
        let long = "e".repeat(2000);
        assert_eq!(trim_stderr(&long).chars().count(), 500);
        assert_eq!(trim_stderr("  short  "), "short");
    }
}
