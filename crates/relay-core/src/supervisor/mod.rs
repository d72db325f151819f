//! Task supervisor: spawns agent children, monitors their event streams,
//! enforces kill conditions, polls research output files, and persists every
//! state transition.
//!
//! One [`monitor::run_monitor`] task runs per live child; the periodic
//! [`TaskSupervisor::check`] sweep handles output-file polling, timeout
//! respawns, and archive rotation. Node-completion callbacks go through the
//! [`NodeCompletionHook`] trait so the supervisor never depends on the
//! executor's concrete type.

pub mod intents;
pub mod monitor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relay_store::JsonStore;
use relay_store::models::{
    ExitReason, ModelTier, SupervisedTask, SwarmRef, TaskKind, TaskRegistry, TaskStatus,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::harness::{AgentCommand, AgentHandle, AgentHarness};
use intents::{IntentTag, parse_intents};

/// Invoked by the supervisor when a swarm-linked task reaches a terminal
/// state. The executor implements this; the supervisor knows only the trait.
#[async_trait]
pub trait NodeCompletionHook: Send + Sync {
    async fn on_node_complete(&self, task_id: &str, swarm_id: &str, node_id: &str, cost_usd: f64);
}

/// Periodic progress report for a running task.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub tool: Option<String>,
    pub tool_calls: u64,
    pub elapsed_secs: u64,
    pub last_file: Option<String>,
    pub cost_usd: f64,
}

pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;
pub type AlertFn = Arc<dyn Fn(String) + Send + Sync>;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Global ceiling on concurrently running children with live PIDs.
    pub global_max_concurrent: usize,
    /// Tool-call ceiling for conversational/research children.
    pub max_tool_calls: u64,
    /// Tool-call ceiling for code children.
    pub code_max_tool_calls: u64,
    /// Per-task USD ceiling.
    pub max_cost_usd: f64,
    pub research_timeout_secs: u64,
    pub code_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub progress_interval: Duration,
    pub watchdog_interval: Duration,
    /// How long to wait for a signalled child before leaking it.
    pub exit_grace: Duration,
    /// Terminal tasks older than this migrate to the archive.
    pub archive_after: chrono::TimeDelta,
    /// The archive keeps at most this many entries.
    pub archive_cap: usize,
    pub default_max_retries: u32,
    /// Working directory for children whose spec names none.
    pub default_workdir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            global_max_concurrent: 5,
            max_tool_calls: 75,
            code_max_tool_calls: 200,
            max_cost_usd: 5.0,
            research_timeout_secs: 15 * 60,
            code_timeout_secs: 90 * 60,
            inactivity_timeout_secs: 180,
            progress_interval: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(5),
            exit_grace: Duration::from_secs(10),
            archive_after: chrono::TimeDelta::hours(24),
            archive_cap: 100,
            default_max_retries: 2,
            default_workdir: PathBuf::from("."),
        }
    }
}

/// Everything needed to register one supervised task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub description: String,
    pub prompt: String,
    pub kind: TaskKind,
    pub model: ModelTier,
    pub output_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub requested_by: String,
    pub max_retries: Option<u32>,
    pub swarm: Option<SwarmRef>,
}

/// Lifetime counters served over `/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorMetrics {
    pub running: usize,
    pub live_tasks: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub exit_reasons: HashMap<String, u64>,
}

/// Bookkeeping for one live child.
struct RunningAgent {
    handle: AgentHandle,
    cancel: CancellationToken,
}

/// The supervisor singleton (dependency-injected, never a static).
pub struct TaskSupervisor {
    store: Arc<JsonStore>,
    harness: Arc<dyn AgentHarness>,
    config: SupervisorConfig,
    registry: Mutex<TaskRegistry>,
    handles: Mutex<HashMap<String, RunningAgent>>,
    hook: Mutex<Option<Arc<dyn NodeCompletionHook>>>,
    progress: Mutex<Option<ProgressFn>>,
    alert: Mutex<Option<AlertFn>>,
}

impl TaskSupervisor {
    pub fn new(
        store: Arc<JsonStore>,
        harness: Arc<dyn AgentHarness>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            harness,
            config,
            registry: Mutex::new(TaskRegistry::default()),
            handles: Mutex::new(HashMap::new()),
            hook: Mutex::new(None),
            progress: Mutex::new(None),
            alert: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }

    pub async fn set_completion_hook(&self, hook: Arc<dyn NodeCompletionHook>) {
        *self.hook.lock().await = Some(hook);
    }

    pub async fn set_progress_callback(&self, f: ProgressFn) {
        *self.progress.lock().await = Some(f);
    }

    pub async fn set_alert_callback(&self, f: AlertFn) {
        *self.alert.lock().await = Some(f);
    }

    /// Restore the registry from disk and resolve orphans.
    ///
    /// Tasks that were `running` when the previous process died lost their
    /// children with it. Swarm-linked orphans are failed outright (the
    /// executor's resume path re-dispatches their nodes); standalone orphans
    /// with a stored prompt and retries left are respawned.
    pub async fn load(self: &Arc<Self>) -> Result<(), RelayError> {
        let loaded = self.store.load_tasks().await?;
        let orphan_ids: Vec<String> = {
            let mut registry = self.registry.lock().await;
            *registry = loaded;
            registry
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running || t.status == TaskStatus::Pending)
                .map(|t| t.id.clone())
                .collect()
        };

        for id in orphan_ids {
            let snapshot = {
                let mut registry = self.registry.lock().await;
                let Some(task) = registry.task_mut(&id) else {
                    continue;
                };
                task.pid = None;
                task.clone()
            };

            let standalone = snapshot.swarm.is_none();
            let respawnable =
                standalone && snapshot.prompt.is_some() && snapshot.retries < snapshot.max_retries;

            if respawnable {
                {
                    let mut registry = self.registry.lock().await;
                    if let Some(task) = registry.task_mut(&id) {
                        task.retries += 1;
                        task.started_at = Some(Utc::now());
                    }
                }
                info!(task_id = %id, "respawning task orphaned by restart");
                if let Err(e) = self.spawn_and_monitor(&id).await {
                    warn!(task_id = %id, error = %e, "orphan respawn failed");
                }
            } else {
                self.finalize(
                    &id,
                    TaskStatus::Failed,
                    ExitReason::Error,
                    None,
                    Some("orphaned by host restart".to_owned()),
                )
                .await;
            }
        }

        self.persist_registry().await;
        Ok(())
    }

    /// Whether a new child may start under the global ceiling.
    pub async fn has_capacity(&self) -> bool {
        self.registry.lock().await.running_with_pid() < self.config.global_max_concurrent
    }

    // -- registration -------------------------------------------------------

    /// Register and spawn a supervised task.
    ///
    /// Refuses new work at the global concurrency ceiling. Spawn failures
    /// surface as [`RelayError::SpawnFailure`]; every later error becomes
    /// terminal task state instead.
    pub async fn register(self: &Arc<Self>, spec: TaskSpec) -> Result<String, RelayError> {
        {
            let registry = self.registry.lock().await;
            let running = registry.running_with_pid();
            if running >= self.config.global_max_concurrent {
                return Err(RelayError::SpawnFailure(format!(
                    "subagent ceiling reached ({running} of {} running)",
                    self.config.global_max_concurrent
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let timeout_secs = spec.timeout_secs.unwrap_or(match spec.kind {
            TaskKind::Research => self.config.research_timeout_secs,
            TaskKind::Code => self.config.code_timeout_secs,
        });
        let prompt = augment_prompt(&spec);

        if let Some(parent) = spec.output_file.as_ref().and_then(|o| o.parent()) {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let task = SupervisedTask {
            id: id.clone(),
            description: spec.description,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            timeout_secs,
            output_file: spec.output_file,
            result: None,
            requested_by: spec.requested_by,
            retries: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
            last_checked_at: now,
            error: None,
            pid: None,
            model: spec.model,
            prompt: Some(prompt),
            kind: spec.kind,
            working_dir: spec.working_dir,
            tool_calls: 0,
            cost_usd: 0.0,
            last_tool: None,
            last_file: None,
            exit_reason: None,
            swarm: spec.swarm,
        };

        {
            let mut registry = self.registry.lock().await;
            registry.tasks.push(task);
        }
        self.persist_registry().await;

        self.spawn_and_monitor(&id).await?;
        Ok(id)
    }

    /// Register a code task working autonomously in `cwd`.
    pub async fn register_code_task(
        self: &Arc<Self>,
        description: impl Into<String>,
        prompt: impl Into<String>,
        cwd: PathBuf,
        requested_by: impl Into<String>,
    ) -> Result<String, RelayError> {
        self.register(TaskSpec {
            description: description.into(),
            prompt: prompt.into(),
            kind: TaskKind::Code,
            model: ModelTier::Opus,
            output_file: None,
            working_dir: Some(cwd),
            timeout_secs: None,
            requested_by: requested_by.into(),
            max_retries: Some(0),
            swarm: None,
        })
        .await
    }

    /// Spawn (or respawn) the child for an already-registered task and start
    /// its monitor.
    async fn spawn_and_monitor(self: &Arc<Self>, task_id: &str) -> Result<(), RelayError> {
        let snapshot = self
            .get(task_id)
            .await
            .ok_or_else(|| RelayError::SpawnFailure(format!("unknown task {task_id}")))?;

        let cmd = AgentCommand {
            task_id: task_id.to_owned(),
            prompt: snapshot.prompt.clone().unwrap_or_default(),
            model: snapshot.model,
            working_dir: snapshot
                .working_dir
                .clone()
                .unwrap_or_else(|| self.config.default_workdir.clone()),
        };

        let handle = match self.harness.spawn(&cmd).await {
            Ok(handle) => handle,
            Err(e) => {
                let detail = format!("{e:#}");
                self.finalize(
                    task_id,
                    TaskStatus::Failed,
                    ExitReason::Error,
                    None,
                    Some(detail.clone()),
                )
                .await;
                return Err(RelayError::SpawnFailure(detail));
            }
        };

        {
            let mut registry = self.registry.lock().await;
            if let Some(task) = registry.task_mut(task_id) {
                task.pid = Some(handle.pid);
                task.status = TaskStatus::Running;
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
            }
        }
        self.persist_registry().await;

        let cancel = CancellationToken::new();
        {
            let mut handles = self.handles.lock().await;
            handles.insert(
                task_id.to_owned(),
                RunningAgent {
                    handle: handle.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            monitor::run_monitor(supervisor, handle, cancel).await;
        });

        Ok(())
    }

    // -- terminal transitions -----------------------------------------------

    /// Mark a task completed with an explicit result.
    pub async fn complete(&self, task_id: &str, result: impl Into<String>) -> bool {
        self.stop_child(task_id).await;
        self.finalize(
            task_id,
            TaskStatus::Completed,
            ExitReason::Completed,
            Some(result.into()),
            None,
        )
        .await
    }

    /// Mark a task failed with an explicit error.
    pub async fn fail(&self, task_id: &str, error: impl Into<String>) -> bool {
        self.stop_child(task_id).await;
        self.finalize(
            task_id,
            TaskStatus::Failed,
            ExitReason::Error,
            None,
            Some(error.into()),
        )
        .await
    }

    /// Terminate a task's child and mark the task failed with `reason`.
    pub async fn cancel(&self, task_id: &str, reason: impl Into<String>) -> bool {
        self.stop_child(task_id).await;
        self.finalize(
            task_id,
            TaskStatus::Failed,
            ExitReason::Cancelled,
            None,
            Some(reason.into()),
        )
        .await
    }

    /// Signal the child (once) and stop its monitor. The reap runs detached
    /// so callers never block on the grace period.
    async fn stop_child(&self, task_id: &str) {
        let agent = self.handles.lock().await.remove(task_id);
        if let Some(agent) = agent {
            agent.cancel.cancel();
            if let Err(e) = self.harness.terminate(&agent.handle).await {
                warn!(task_id, error = %e, "failed to signal child");
            }
            let harness = Arc::clone(&self.harness);
            let grace = self.config.exit_grace;
            tokio::spawn(async move {
                let _ = harness.wait(&agent.handle, grace).await;
            });
        }
    }

    /// Apply a terminal transition exactly once.
    ///
    /// Returns false when the task is unknown or already terminal; the
    /// recorded exit reason is never overwritten. On a real transition the
    /// completion hook fires for swarm-linked tasks.
    pub(crate) async fn finalize(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: ExitReason,
        result: Option<String>,
        error: Option<String>,
    ) -> bool {
        let snapshot = {
            let mut registry = self.registry.lock().await;
            let Some(task) = registry.task_mut(task_id) else {
                return false;
            };
            if task.status.is_terminal() || task.exit_reason.is_some() {
                return false;
            }
            task.status = status;
            task.exit_reason = Some(reason);
            task.completed_at = Some(Utc::now());
            if result.is_some() {
                task.result = result;
            }
            if error.is_some() {
                task.error = error;
            }
            task.pid = None;
            let snapshot = task.clone();
            registry.record_exit(reason);
            snapshot
        };
        self.persist_registry().await;

        self.handles.lock().await.remove(task_id);

        info!(
            task_id,
            status = %snapshot.status,
            exit_reason = %reason,
            cost_usd = snapshot.cost_usd,
            "task finalized"
        );

        if let Some(ref swarm) = snapshot.swarm {
            let hook = self.hook.lock().await.clone();
            if let Some(hook) = hook {
                hook.on_node_complete(task_id, &swarm.swarm_id, &swarm.node_id, snapshot.cost_usd)
                    .await;
            }
        }

        true
    }

    // -- queries ------------------------------------------------------------

    pub async fn get(&self, task_id: &str) -> Option<SupervisedTask> {
        self.registry.lock().await.task(task_id).cloned()
    }

    pub async fn list(&self) -> Vec<SupervisedTask> {
        self.registry.lock().await.tasks.clone()
    }

    pub async fn running_tasks(&self) -> Vec<SupervisedTask> {
        self.registry
            .lock()
            .await
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    pub async fn metrics(&self) -> SupervisorMetrics {
        let registry = self.registry.lock().await;
        SupervisorMetrics {
            running: registry.running_with_pid(),
            live_tasks: registry.tasks.len(),
            total_completed: registry.total_completed,
            total_failed: registry.total_failed,
            total_timed_out: registry.total_timed_out,
            exit_reasons: registry.exit_reasons.clone(),
        }
    }

    // -- periodic sweep -----------------------------------------------------

    /// Heartbeat sweep: poll research output files, enforce research wall
    /// clocks with retry/respawn, and rotate old terminal tasks into the
    /// archive.
    pub async fn check(self: &Arc<Self>) {
        let now = Utc::now();
        let candidates: Vec<SupervisedTask> = {
            let mut registry = self.registry.lock().await;
            registry.last_check_at = Some(now);
            for task in &mut registry.tasks {
                task.last_checked_at = now;
            }
            registry
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running && t.output_file.is_some())
                .cloned()
                .collect()
        };
        self.persist_registry().await;

        for task in candidates {
            let path = task.output_file.clone().unwrap_or_default();

            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => {
                    let preview: String = contents.chars().take(200).collect();
                    let chars = contents.chars().count();
                    self.stop_child(&task.id).await;
                    self.finalize(
                        &task.id,
                        TaskStatus::Completed,
                        ExitReason::Completed,
                        Some(format!("Output saved to {} ({chars} chars)", path.display())),
                        None,
                    )
                    .await;
                    info!(task_id = %task.id, preview = %preview, "research output collected");
                }
                Err(_) if task.elapsed_secs(now) > task.timeout_secs => {
                    if task.retries < task.max_retries {
                        self.stop_child(&task.id).await;
                        {
                            let mut registry = self.registry.lock().await;
                            if let Some(t) = registry.task_mut(&task.id) {
                                t.retries += 1;
                                t.started_at = Some(now);
                                t.pid = None;
                            }
                        }
                        self.persist_registry().await;
                        self.send_alert(format!(
                            "Task \"{}\" produced no output in {}s; retrying (attempt {} of {}).",
                            task.description,
                            task.timeout_secs,
                            task.retries + 1,
                            task.max_retries + 1,
                        ))
                        .await;
                        if let Err(e) = self.spawn_and_monitor(&task.id).await {
                            error!(task_id = %task.id, error = %e, "respawn failed");
                        }
                    } else {
                        let elapsed = task.elapsed_secs(now);
                        self.stop_child(&task.id).await;
                        self.finalize(
                            &task.id,
                            TaskStatus::Timeout,
                            ExitReason::WallClock,
                            None,
                            Some(format!("no output after {elapsed}s (limit {}s)", task.timeout_secs)),
                        )
                        .await;
                        self.send_alert(format!(
                            "Task \"{}\" timed out after {elapsed}s with no output; giving up.",
                            task.description,
                        ))
                        .await;
                    }
                }
                Err(_) => {}
            }
        }

        self.rotate_archive(now).await;
    }

    /// Move terminal tasks past the retention window into the bounded
    /// archive.
    async fn rotate_archive(&self, now: chrono::DateTime<Utc>) {
        let aged: Vec<SupervisedTask> = {
            let mut registry = self.registry.lock().await;
            let cutoff = now - self.config.archive_after;
            let (keep, aged): (Vec<_>, Vec<_>) =
                registry.tasks.drain(..).partition(|t| {
                    !(t.status.is_terminal()
                        && t.completed_at.map(|at| at < cutoff).unwrap_or(false))
                });
            registry.tasks = keep;
            aged
        };
        if aged.is_empty() {
            return;
        }

        let count = aged.len();
        let mut archive = match self.store.load_archive().await {
            Ok(archive) => archive,
            Err(e) => {
                warn!(error = %e, "failed to load archive, starting empty");
                Vec::new()
            }
        };
        archive.extend(aged);
        archive.sort_by_key(|t| t.completed_at);
        if archive.len() > self.config.archive_cap {
            let excess = archive.len() - self.config.archive_cap;
            archive.drain(..excess);
        }

        if let Err(e) = self.store.save_archive(&archive).await {
            warn!(error = %e, "failed to persist archive");
        }
        self.persist_registry().await;
        info!(archived = count, "rotated terminal tasks into archive");
    }

    // -- intent processing --------------------------------------------------

    /// Scan assistant text for `[TASK: ...]` tags, registering a research
    /// task per tag and replacing the literal tag with a started notice.
    ///
    /// A malformed tag fails the parse and leaves the text untouched.
    pub async fn process_task_intents(
        self: &Arc<Self>,
        text: &str,
        requested_by: &str,
    ) -> Result<(String, Vec<String>), RelayError> {
        let parsed = parse_intents(text)?;
        let mut out = String::with_capacity(text.len());
        let mut task_ids = Vec::new();
        let mut last = 0;

        for intent in parsed {
            let IntentTag::Task {
                description,
                output,
                prompt,
            } = intent.tag
            else {
                continue;
            };

            out.push_str(&text[last..intent.span.start]);
            let output_file = output
                .map(PathBuf::from)
                .unwrap_or_else(|| self.store.dir().default_task_output(Utc::now()));

            let spec = TaskSpec {
                description: description.clone(),
                prompt,
                kind: TaskKind::Research,
                model: ModelTier::Sonnet,
                output_file: Some(output_file),
                working_dir: None,
                timeout_secs: None,
                requested_by: requested_by.to_owned(),
                max_retries: None,
                swarm: None,
            };
            match self.register(spec).await {
                Ok(id) => {
                    out.push_str(&format!("Background task started: {description} ({id})"));
                    task_ids.push(id);
                }
                Err(e) => {
                    warn!(error = %e, description = %description, "task intent registration failed");
                    out.push_str(&text[intent.span.clone()]);
                }
            }
            last = intent.span.end;
        }

        out.push_str(&text[last..]);
        Ok((out, task_ids))
    }

    /// Scan assistant text for `[CODE_TASK: ...]` tags. The working
    /// directory must exist or the tag is left intact.
    pub async fn process_code_task_intents(
        self: &Arc<Self>,
        text: &str,
        requested_by: &str,
    ) -> Result<(String, Vec<String>), RelayError> {
        let parsed = parse_intents(text)?;
        let mut out = String::with_capacity(text.len());
        let mut task_ids = Vec::new();
        let mut last = 0;

        for intent in parsed {
            let IntentTag::CodeTask { cwd, prompt } = intent.tag else {
                continue;
            };

            out.push_str(&text[last..intent.span.start]);
            let dir = PathBuf::from(&cwd);
            let dir_ok = tokio::fs::metadata(&dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);

            if !dir_ok {
                warn!(cwd = %cwd, "code task intent names a missing directory");
                out.push_str(&text[intent.span.clone()]);
                last = intent.span.end;
                continue;
            }

            let description = format!("code task in {cwd}");
            match self
                .register_code_task(description.clone(), prompt, dir, requested_by)
                .await
            {
                Ok(id) => {
                    out.push_str(&format!("Background task started: {description} ({id})"));
                    task_ids.push(id);
                }
                Err(e) => {
                    warn!(error = %e, cwd = %cwd, "code task intent registration failed");
                    out.push_str(&text[intent.span.clone()]);
                }
            }
            last = intent.span.end;
        }

        out.push_str(&text[last..]);
        Ok((out, task_ids))
    }

    // -- shared internals ---------------------------------------------------

    pub(crate) async fn persist_registry(&self) {
        let snapshot = self.registry.lock().await.clone();
        // Persistence failures never block the main flow.
        if let Err(e) = self.store.save_tasks(&snapshot).await {
            warn!(error = %e, "failed to persist task registry");
        }
    }

    pub(crate) async fn send_alert(&self, message: String) {
        let alert = self.alert.lock().await.clone();
        if let Some(alert) = alert {
            alert(message);
        }
    }
}

/// Append the per-kind standing instructions to a task prompt.
fn augment_prompt(spec: &TaskSpec) -> String {
    match spec.kind {
        TaskKind::Research => match &spec.output_file {
            Some(output) => format!(
                "{}\n\nWrite your complete result to {} using the Write tool. \
                 Never ask clarifying questions; decide and proceed.",
                spec.prompt,
                output.display()
            ),
            None => spec.prompt.clone(),
        },
        TaskKind::Code => format!(
            "{}\n\nWork autonomously in the current working directory. \
             Your final message should summarize the edits you made.",
            spec.prompt
        ),
    }
}
