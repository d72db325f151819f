//! Claude Code harness adapter.
//!
//! Spawns `<agent> -p <prompt> --output-format stream-json --verbose
//! --model <id> --dangerously-skip-permissions` and parses the JSONL on its
//! stdout into [`AgentEvent`] values.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::trait_def::{AgentHarness, ExitOutcome};
use super::types::{AgentCommand, AgentEvent, AgentHandle};

/// Internal state kept per spawned process.
struct ProcessState {
    child: Child,
    /// Stdout reader; `Option` so it can be `.take()`-ed once for streaming.
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    /// Set after the one allowed termination signal.
    signalled: bool,
}

/// Harness adapter for the Claude Code CLI.
#[derive(Clone)]
pub struct ClaudeHarness {
    /// Path to the agent binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
    /// Per-process bookkeeping, keyed by OS pid.
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for ClaudeHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeHarness")
            .field("binary_path", &self.binary_path)
            .finish()
    }
}

impl ClaudeHarness {
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Use a custom binary path (`CLAUDE_PATH`, or a fake agent in tests).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ClaudeHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing
// ---------------------------------------------------------------------------

/// Parse one stream-json line into an event.
///
/// Returns `Ok(None)` for recognized-but-irrelevant event types; `Err` only
/// for malformed JSON, which callers treat as a warning and skip.
fn parse_stream_line(line: &str) -> Result<Option<AgentEvent>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;

    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "assistant" => {
            let tool = v
                .get("toolName")
                .and_then(|t| t.as_str())
                .map(str::to_owned);
            let input = v.get("toolInput").cloned().unwrap_or(serde_json::Value::Null);
            Ok(Some(AgentEvent::ToolUse { tool, input }))
        }
        "result" => {
            let text = v
                .get("resultText")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_owned();
            let is_error = v.get("isError").and_then(|b| b.as_bool()).unwrap_or(false);
            let input_tokens = v.get("inputTokens").and_then(|n| n.as_u64()).unwrap_or(0);
            let output_tokens = v.get("outputTokens").and_then(|n| n.as_u64()).unwrap_or(0);
            Ok(Some(AgentEvent::Result {
                text,
                is_error,
                input_tokens,
                output_tokens,
            }))
        }
        other => {
            debug!(event_type = other, "ignoring unrecognized stream event type");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// AgentHarness implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl AgentHarness for ClaudeHarness {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn spawn(&self, cmd: &AgentCommand) -> Result<AgentHandle> {
        let mut command = Command::new(&self.binary_path);

        // The prompt is its own argv element: no shell, no metacharacter
        // expansion.
        command
            .arg("-p")
            .arg(&cmd.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(cmd.model.model_id())
            .arg("--dangerously-skip-permissions");

        command.current_dir(&cmd.working_dir);

        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                pid,
                ProcessState {
                    child,
                    stdout,
                    stderr,
                    signalled: false,
                },
            );
        }

        debug!(pid, task_id = %cmd.task_id, model = %cmd.model, "spawned agent child");

        Ok(AgentHandle {
            pid,
            task_id: cmd.task_id.clone(),
            harness_name: self.name().to_owned(),
        })
    }

    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "stdout not available (already consumed or process missing)");
                yield AgentEvent::Completed;
                return;
            };

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_stream_line(trimmed) {
                            Ok(Some(event)) => yield event,
                            Ok(None) => {}
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        break;
                    }
                }
            }

            yield AgentEvent::Completed;
        };

        Box::pin(stream)
    }

    async fn terminate(&self, handle: &AgentHandle) -> Result<()> {
        let mut processes = self.processes.lock().await;

        let Some(state) = processes.get_mut(&handle.pid) else {
            debug!(pid = handle.pid, "terminate called but process not in map (already exited?)");
            return Ok(());
        };

        if state.signalled {
            return Ok(());
        }
        state.signalled = true;

        #[cfg(unix)]
        {
            // SAFETY: pid came from a child we spawned.
            let ret = unsafe { libc::kill(handle.pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid = handle.pid, "SIGTERM delivery failed (child already gone?)");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = state.child.start_kill();
        }

        Ok(())
    }

    async fn wait(&self, handle: &AgentHandle, grace: Duration) -> ExitOutcome {
        let state = {
            let mut processes = self.processes.lock().await;
            processes.remove(&handle.pid)
        };

        let Some(mut state) = state else {
            return ExitOutcome {
                code: None,
                stderr: String::new(),
            };
        };

        let mut stderr_buf = String::new();
        if let Some(mut stderr) = state.stderr.take() {
            // Bounded: a child flooding stderr should not stall finalization.
            let _ = tokio::time::timeout(grace, stderr.read_to_string(&mut stderr_buf)).await;
        }

        match tokio::time::timeout(grace, state.child.wait()).await {
            Ok(Ok(status)) => ExitOutcome {
                code: status.code(),
                stderr: stderr_buf,
            },
            Ok(Err(e)) => {
                warn!(pid = handle.pid, error = %e, "error waiting for child");
                ExitOutcome {
                    code: None,
                    stderr: stderr_buf,
                }
            }
            Err(_) => {
                // Ignored its signal; leak it to the OS and finalize the record.
                warn!(pid = handle.pid, "child ignored termination, leaking to OS");
                ExitOutcome {
                    code: None,
                    stderr: stderr_buf,
                }
            }
        }
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&handle.pid) {
            match state.child.try_wait() {
                Ok(Some(_status)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(pid = handle.pid, error = %e, "error checking process status");
                    false
                }
            }
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relay_store::models::ModelTier;

    fn test_command(working_dir: &std::path::Path) -> AgentCommand {
        AgentCommand {
            task_id: "task-test".to_owned(),
            prompt: "say hello".to_owned(),
            model: ModelTier::Sonnet,
            working_dir: working_dir.to_path_buf(),
        }
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    // -- JSONL parsing tests -----------------------------------------------

    #[test]
    fn parse_assistant_event() {
        let line = r#"{"type":"assistant","toolName":"Bash","toolInput":{"command":"ls -la"}}"#;
        let event = parse_stream_line(line).unwrap().unwrap();
        assert_eq!(
            event,
            AgentEvent::ToolUse {
                tool: Some("Bash".to_owned()),
                input: serde_json::json!({"command": "ls -la"}),
            }
        );
    }

    #[test]
    fn parse_assistant_event_without_tool() {
        let line = r#"{"type":"assistant"}"#;
        let event = parse_stream_line(line).unwrap().unwrap();
        assert_eq!(
            event,
            AgentEvent::ToolUse {
                tool: None,
                input: serde_json::Value::Null,
            }
        );
    }

    #[test]
    fn parse_result_event() {
        let line = r#"{"type":"result","resultText":"Done.","isError":false,"inputTokens":500,"outputTokens":200}"#;
        let event = parse_stream_line(line).unwrap().unwrap();
        assert_eq!(
            event,
            AgentEvent::Result {
                text: "Done.".to_owned(),
                is_error: false,
                input_tokens: 500,
                output_tokens: 200,
            }
        );
    }

    #[test]
    fn parse_result_event_error_flag() {
        let line = r#"{"type":"result","resultText":"boom","isError":true}"#;
        let event = parse_stream_line(line).unwrap().unwrap();
        assert!(matches!(event, AgentEvent::Result { is_error: true, .. }));
    }

    #[test]
    fn parse_unknown_type_is_ignored() {
        let line = r#"{"type":"system","data":"warmup"}"#;
        assert!(parse_stream_line(line).unwrap().is_none());
    }

    #[test]
    fn parse_malformed_json_is_error() {
        assert!(parse_stream_line("this is not json").is_err());
    }

    // -- subprocess integration tests ---------------------------------------

    #[tokio::test]
    async fn spawn_and_stream_scripted_events() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_agent.sh",
            "#!/bin/sh\n\
             echo '{\"type\":\"assistant\",\"toolName\":\"Read\",\"toolInput\":{\"file_path\":\"/tmp/a.rs\"}}'\n\
             echo '{\"type\":\"result\",\"resultText\":\"ok\",\"isError\":false,\"inputTokens\":10,\"outputTokens\":5}'\n",
        );

        let harness = ClaudeHarness::with_binary(&script);
        let handle = harness.spawn(&test_command(tmp.path())).await.unwrap();
        assert!(handle.pid > 0);
        assert_eq!(handle.harness_name, "claude-code");

        let events: Vec<AgentEvent> = harness.events(&handle).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], AgentEvent::ToolUse { tool: Some(t), .. } if t == "Read"));
        assert!(matches!(&events[1], AgentEvent::Result { text, .. } if text == "ok"));
        assert_eq!(events.last().unwrap(), &AgentEvent::Completed);

        let outcome = harness.wait(&handle, Duration::from_secs(5)).await;
        assert_eq!(outcome.code, Some(0));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "bad_agent.sh",
            "#!/bin/sh\n\
             echo 'not json'\n\
             echo ''\n\
             echo '{\"type\":\"result\",\"resultText\":\"valid\"}'\n\
             echo 'still {{ not json'\n",
        );

        let harness = ClaudeHarness::with_binary(&script);
        let handle = harness.spawn(&test_command(tmp.path())).await.unwrap();
        let events: Vec<AgentEvent> = harness.events(&handle).collect().await;

        assert!(
            events
                .iter()
                .any(|e| matches!(e, AgentEvent::Result { text, .. } if text == "valid"))
        );
        assert_eq!(events.last().unwrap(), &AgentEvent::Completed);
    }

    #[tokio::test]
    async fn spawn_binary_not_found_is_error() {
        let harness = ClaudeHarness::with_binary("/nonexistent/path/to/agent");
        let result = harness.spawn(&test_command(std::path::Path::new("/tmp"))).await;
        assert!(result.is_err());
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to spawn agent binary"), "got: {msg}");
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_child() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy.sh", "#!/bin/sh\nsleep 3600\n");

        let harness = ClaudeHarness::with_binary(&script);
        let handle = harness.spawn(&test_command(tmp.path())).await.unwrap();
        assert!(harness.is_running(&handle).await);

        harness.terminate(&handle).await.unwrap();
        // Second terminate is a no-op, not a second signal.
        harness.terminate(&handle).await.unwrap();

        let outcome = harness.wait(&handle, Duration::from_secs(5)).await;
        assert_ne!(outcome.code, Some(0));
        assert!(!harness.is_running(&handle).await);
    }

    #[tokio::test]
    async fn wait_collects_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "noisy.sh",
            "#!/bin/sh\necho 'diagnostic detail' >&2\nexit 3\n",
        );

        let harness = ClaudeHarness::with_binary(&script);
        let handle = harness.spawn(&test_command(tmp.path())).await.unwrap();
        // Drain stdout to EOF first so the child can finish.
        let _events: Vec<AgentEvent> = harness.events(&handle).collect().await;

        let outcome = harness.wait(&handle, Duration::from_secs(5)).await;
        assert_eq!(outcome.code, Some(3));
        assert!(outcome.stderr.contains("diagnostic detail"));
    }

    #[tokio::test]
    async fn is_running_false_after_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "quick.sh", "#!/bin/sh\nexit 0\n");

        let harness = ClaudeHarness::with_binary(&script);
        let handle = harness.spawn(&test_command(tmp.path())).await.unwrap();

        for _ in 0..20 {
            if !harness.is_running(&handle).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("process did not exit within 2 seconds");
    }
}
