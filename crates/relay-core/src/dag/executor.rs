//! The DAG executor: drives registered swarm graphs to completion.
//!
//! Event-driven with a periodic safety net: `tick` runs on node completion
//! and on the heartbeat sweep (`tick_all`). Each tick enforces the graph's
//! budget and wall clock, promotes checkpointed nodes, computes the ready
//! set, and dispatches under the per-graph and global concurrency ceilings.
//! Every mutation persists through the store before the tick returns, and a
//! graph that reaches a terminal status leaves the active set (its on-disk
//! document is retained for inspection).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use relay_store::JsonStore;
use relay_store::models::{
    Checkpoint, NodeKind, NodeStatus, SwarmDag, SwarmRef, SwarmStatus, TaskKind, TaskStatus,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::router::ModelRouter;
use crate::supervisor::{NodeCompletionHook, TaskSpec, TaskSupervisor};

/// Receives the single notification a graph emits on reaching a terminal
/// state.
#[async_trait]
pub trait SwarmNotifier: Send + Sync {
    async fn notify(&self, initiator: &str, message: &str);
}

/// The executor singleton (dependency-injected, never a static).
pub struct DagExecutor {
    store: Arc<JsonStore>,
    supervisor: Arc<TaskSupervisor>,
    router: ModelRouter,
    swarms: Mutex<HashMap<String, SwarmDag>>,
    notifier: Mutex<Option<Arc<dyn SwarmNotifier>>>,
}

impl DagExecutor {
    pub fn new(
        store: Arc<JsonStore>,
        supervisor: Arc<TaskSupervisor>,
        router: ModelRouter,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            router,
            swarms: Mutex::new(HashMap::new()),
            notifier: Mutex::new(None),
        })
    }

    /// Register this executor as the supervisor's completion hook. Call once
    /// at startup; this is what breaks the import cycle between the two.
    pub async fn attach(self: &Arc<Self>) {
        self.supervisor
            .set_completion_hook(Arc::clone(self) as Arc<dyn NodeCompletionHook>)
            .await;
    }

    pub async fn set_notifier(&self, notifier: Arc<dyn SwarmNotifier>) {
        *self.notifier.lock().await = Some(notifier);
    }

    // -- lifecycle operations -----------------------------------------------

    /// Reload every `running` or `paused` graph document from disk into the
    /// active set. In-flight nodes without a checkpoint lost their children
    /// with the old process and are reset to `pending`; checkpointed nodes
    /// will be promoted on the next tick. Returns the number reloaded.
    pub async fn resume_from_disk(&self) -> Result<usize, RelayError> {
        let docs = self.store.list_dags().await?;
        let mut swarms = self.swarms.lock().await;
        let mut count = 0;

        for mut dag in docs {
            if !matches!(dag.status, SwarmStatus::Running | SwarmStatus::Paused) {
                continue;
            }
            for node in &mut dag.nodes {
                if node.checkpoint.is_none() && node.status.is_in_flight() {
                    node.status = NodeStatus::Pending;
                    node.task_id = None;
                }
            }
            info!(swarm_id = %dag.id, status = %dag.status, "resumed swarm from disk");
            self.persist(&dag).await;
            swarms.insert(dag.id.clone(), dag);
            count += 1;
        }

        Ok(count)
    }

    /// Transition a freshly built graph `planning -> running` and tick it.
    pub async fn start(&self, mut dag: SwarmDag) -> Result<String, RelayError> {
        if dag.status != SwarmStatus::Planning {
            return Err(RelayError::Validation(format!(
                "swarm {} has status {}, expected planning",
                dag.id, dag.status
            )));
        }

        dag.status = SwarmStatus::Running;
        dag.budget.started_at = Some(Utc::now());
        let id = dag.id.clone();

        self.store.save_dag(&dag).await?;
        self.swarms.lock().await.insert(id.clone(), dag);

        info!(swarm_id = %id, "swarm started");
        self.tick(&id).await;
        Ok(id)
    }

    pub async fn pause(&self, swarm_id: &str) -> Result<(), RelayError> {
        let mut swarms = self.swarms.lock().await;
        let dag = swarms
            .get_mut(swarm_id)
            .ok_or_else(|| RelayError::Validation(format!("unknown swarm {swarm_id}")))?;
        if dag.status != SwarmStatus::Running {
            return Err(RelayError::Validation(format!(
                "swarm {swarm_id} has status {}, expected running",
                dag.status
            )));
        }
        dag.status = SwarmStatus::Paused;
        self.persist(dag).await;
        Ok(())
    }

    pub async fn resume(&self, swarm_id: &str) -> Result<(), RelayError> {
        {
            let mut swarms = self.swarms.lock().await;
            let dag = swarms
                .get_mut(swarm_id)
                .ok_or_else(|| RelayError::Validation(format!("unknown swarm {swarm_id}")))?;
            if dag.status != SwarmStatus::Paused {
                return Err(RelayError::Validation(format!(
                    "swarm {swarm_id} has status {}, expected paused",
                    dag.status
                )));
            }
            dag.status = SwarmStatus::Running;
            self.persist(dag).await;
        }
        self.tick(swarm_id).await;
        Ok(())
    }

    /// Cancel a graph: terminate its children, skip every unfinished node,
    /// and drop it from the active set.
    pub async fn cancel(&self, swarm_id: &str) -> Result<(), RelayError> {
        let (doc, task_ids) = {
            let mut swarms = self.swarms.lock().await;
            let mut dag = swarms
                .remove(swarm_id)
                .ok_or_else(|| RelayError::Validation(format!("unknown swarm {swarm_id}")))?;

            let task_ids: Vec<String> = dag
                .nodes
                .iter()
                .filter(|n| n.status.is_in_flight())
                .filter_map(|n| n.task_id.clone())
                .collect();

            for node in &mut dag.nodes {
                if !node.status.is_terminal() {
                    node.status = NodeStatus::Skipped;
                }
                node.task_id = None;
            }
            dag.status = SwarmStatus::Cancelled;
            dag.completed_at = Some(Utc::now());
            (dag, task_ids)
        };

        // Children are cancelled after the graph left the active set, so
        // late completion callbacks find nothing and no-op.
        for task_id in task_ids {
            self.supervisor.cancel(&task_id, "swarm cancelled").await;
        }

        self.persist(&doc).await;
        info!(swarm_id, "swarm cancelled");
        self.send_notification(&doc.initiator, format!("Swarm \"{}\" was cancelled.", doc.name))
            .await;
        Ok(())
    }

    /// Re-run a failed graph: failed and skipped nodes go back to `pending`
    /// with fresh retry counters; completed nodes keep their checkpoints.
    pub async fn retry(&self, swarm_id: &str) -> Result<(), RelayError> {
        {
            let mut swarms = self.swarms.lock().await;

            // Terminal graphs leave the active set; fall back to disk.
            let mut reloaded = false;
            if !swarms.contains_key(swarm_id) {
                let doc = self
                    .store
                    .load_dag(swarm_id)
                    .await?
                    .ok_or_else(|| RelayError::Validation(format!("unknown swarm {swarm_id}")))?;
                swarms.insert(swarm_id.to_owned(), doc);
                reloaded = true;
            }

            let status = match swarms.get(swarm_id) {
                Some(dag) => dag.status,
                None => {
                    return Err(RelayError::Validation(format!("unknown swarm {swarm_id}")));
                }
            };
            if status != SwarmStatus::Failed {
                if reloaded {
                    swarms.remove(swarm_id);
                }
                return Err(RelayError::Validation(format!(
                    "swarm {swarm_id} has status {status}, expected failed"
                )));
            }

            if let Some(dag) = swarms.get_mut(swarm_id) {
                for node in &mut dag.nodes {
                    if matches!(node.status, NodeStatus::Failed | NodeStatus::Skipped) {
                        node.status = NodeStatus::Pending;
                        node.retries = 0;
                        node.task_id = None;
                    }
                }
                dag.status = SwarmStatus::Running;
                dag.error = None;
                dag.completed_at = None;
                dag.budget.started_at = Some(Utc::now());
                self.persist(dag).await;
            }
        }

        info!(swarm_id, "swarm retry requested");
        self.tick(swarm_id).await;
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    /// Active graphs, sorted by id (creation order).
    pub async fn list(&self) -> Vec<SwarmDag> {
        let swarms = self.swarms.lock().await;
        let mut dags: Vec<SwarmDag> = swarms.values().cloned().collect();
        dags.sort_by(|a, b| a.id.cmp(&b.id));
        dags
    }

    /// Fetch a graph from the active set, falling back to its on-disk
    /// document for terminated graphs.
    pub async fn get(&self, swarm_id: &str) -> Option<SwarmDag> {
        if let Some(dag) = self.swarms.lock().await.get(swarm_id) {
            return Some(dag.clone());
        }
        self.store.load_dag(swarm_id).await.ok().flatten()
    }

    /// One-line human status.
    pub fn status_line(dag: &SwarmDag) -> String {
        let done = dag.count_with_status(NodeStatus::Completed)
            + dag.count_with_status(NodeStatus::Skipped);
        format!(
            "{} \"{}\": {} -- {done}/{} nodes done, {} in flight, ${:.2}/${:.2} spent",
            dag.id,
            dag.name,
            dag.status,
            dag.nodes.len(),
            dag.in_flight_count(),
            dag.budget.spent_usd,
            dag.budget.max_cost_usd,
        )
    }

    // -- the tick -----------------------------------------------------------

    /// Safety-net sweep over every active graph.
    pub async fn tick_all(&self) {
        let ids: Vec<String> = self.swarms.lock().await.keys().cloned().collect();
        for id in ids {
            self.tick(&id).await;
        }
    }

    /// The central procedure; idempotent and re-entrant-safe per graph.
    pub async fn tick(&self, swarm_id: &str) {
        let mut notification: Option<(String, String)> = None;

        {
            let mut swarms = self.swarms.lock().await;
            let Some(dag) = swarms.get_mut(swarm_id) else {
                debug!(swarm_id, "tick for inactive swarm, ignoring");
                return;
            };

            if dag.status != SwarmStatus::Running {
                return;
            }

            let now = Utc::now();

            if dag.budget.spent_usd >= dag.budget.max_cost_usd {
                let error = format!(
                    "budget exceeded: spent ${:.2} of ${:.2}",
                    dag.budget.spent_usd, dag.budget.max_cost_usd
                );
                notification = Some(fail_graph(dag, error));
            } else if let Some(elapsed) = wall_clock_overrun(dag, now) {
                let error = format!(
                    "wall clock exceeded: {elapsed}s > {}s",
                    dag.budget.max_wall_clock_secs
                );
                notification = Some(fail_graph(dag, error));
            } else {
                promote_checkpointed(dag);
                mark_ready(dag);

                let ready: Vec<String> = dag
                    .nodes
                    .iter()
                    .filter(|n| n.status == NodeStatus::Ready)
                    .map(|n| n.id.clone())
                    .collect();

                if ready.is_empty() {
                    let in_flight = dag
                        .nodes
                        .iter()
                        .any(|n| matches!(n.status, NodeStatus::Queued | NodeStatus::Running));
                    if !in_flight {
                        propagate_skips(dag);
                        if let Some(critical) = find_critical_failure(dag) {
                            let error =
                                format!("node \"{critical}\" failed and strands downstream work");
                            notification = Some(fail_graph(dag, error));
                        } else if dag.nodes.iter().all(|n| n.status.is_terminal()) {
                            // A failed optional node does not spoil the run;
                            // a failed required node does, even as a leaf.
                            let permanent = dag
                                .nodes
                                .iter()
                                .find(|n| n.status == NodeStatus::Failed && !n.optional)
                                .map(|n| n.label.clone());
                            notification = Some(match permanent {
                                Some(label) => {
                                    fail_graph(dag, format!("node \"{label}\" failed permanently"))
                                }
                                None => self.complete_graph(dag).await,
                            });
                        }
                        // else: blocked pending nodes remain; the safety-net
                        // sweep revisits.
                    }
                } else {
                    self.dispatch_ready(dag, ready).await;
                }
            }

            self.persist(dag).await;
            if dag.status.is_terminal() {
                swarms.remove(swarm_id);
            }
        }

        if let Some((initiator, message)) = notification {
            self.send_notification(&initiator, message).await;
        }
    }

    /// Dispatch ready nodes under the per-graph and global ceilings.
    async fn dispatch_ready(&self, dag: &mut SwarmDag, ready: Vec<String>) {
        for node_id in ready {
            if dag.in_flight_count() >= dag.budget.max_concurrent {
                debug!(swarm_id = %dag.id, "per-graph concurrency ceiling reached");
                break;
            }
            if !self.supervisor.has_capacity().await {
                debug!(swarm_id = %dag.id, "supervisor saturated, deferring dispatch");
                break;
            }
            self.dispatch_node(dag, &node_id).await;
        }
    }

    /// Dispatch one node: enrich the prompt with predecessor outputs,
    /// resolve the model, and register a supervised task carrying the
    /// completion back-reference.
    async fn dispatch_node(&self, dag: &mut SwarmDag, node_id: &str) {
        let pred_ids: Vec<String> = dag
            .predecessor_ids(node_id)
            .into_iter()
            .map(str::to_owned)
            .collect();

        let mut input_blocks = String::new();
        for pred_id in &pred_ids {
            let label = dag
                .node(pred_id)
                .map(|n| n.label.clone())
                .unwrap_or_else(|| pred_id.clone());
            match self.store.read_scratchpad(&dag.id, pred_id).await {
                Ok(Some(output)) if !output.is_empty() => {
                    input_blocks.push_str(&format!("## Input from \"{label}\":\n\n{output}\n\n"));
                }
                Ok(_) => {}
                Err(e) => warn!(swarm_id = %dag.id, pred_id, error = %e, "scratchpad read failed"),
            }
        }

        let Some(node) = dag.node(node_id) else {
            return;
        };
        let kind = node.kind;
        let label = node.label.clone();
        let enriched_prompt = format!("{input_blocks}{}", node.prompt);
        let timeout_secs = node.timeout_secs;
        let explicit_model = node.model;

        let mut model = self.router.select(kind, &dag.budget, explicit_model);
        let check = self.router.check(kind, model, &dag.budget);
        if !check.allowed {
            let reason = check.reason.unwrap_or_else(|| "budget check rejected".to_owned());
            self.handle_dispatch_failure(dag, node_id, &reason);
            return;
        }
        if let Some(suggested) = check.suggested_model {
            debug!(swarm_id = %dag.id, node_id, from = %model, to = %suggested, "budget downgrade");
            model = suggested;
        }

        // Code children edit project files in the swarm directory; every
        // other kind writes a scratchpad file.
        let (task_kind, output_file, working_dir) = if kind == NodeKind::Code {
            let dir = self.store.dir().swarm_dir(&dag.id);
            let _ = tokio::fs::create_dir_all(&dir).await;
            (TaskKind::Code, None, Some(dir))
        } else {
            (
                TaskKind::Research,
                Some(self.store.dir().scratchpad_file(&dag.id, node_id)),
                None,
            )
        };

        if let Some(node) = dag.node_mut(node_id) {
            node.status = NodeStatus::Queued;
        }

        let spec = TaskSpec {
            description: label,
            prompt: enriched_prompt,
            kind: task_kind,
            model,
            output_file,
            working_dir,
            timeout_secs,
            requested_by: dag.initiator.clone(),
            // Node retries belong to the executor; the supervisor must not
            // respawn on its own.
            max_retries: Some(0),
            swarm: Some(SwarmRef {
                swarm_id: dag.id.clone(),
                node_id: node_id.to_owned(),
            }),
        };

        match self.supervisor.register(spec).await {
            Ok(task_id) => {
                let has_pid = self
                    .supervisor
                    .get(&task_id)
                    .await
                    .and_then(|t| t.pid)
                    .is_some();
                if let Some(node) = dag.node_mut(node_id) {
                    node.task_id = Some(task_id.clone());
                    if has_pid {
                        node.status = NodeStatus::Running;
                    }
                }
                info!(swarm_id = %dag.id, node_id, task_id = %task_id, model = %model, "node dispatched");
            }
            Err(e) => {
                let reason = e.to_string();
                self.handle_dispatch_failure(dag, node_id, &reason);
            }
        }
    }

    /// A per-node exception never crosses the tick boundary: burn a retry
    /// or fail the node, and let the normal failure handling take over.
    fn handle_dispatch_failure(&self, dag: &mut SwarmDag, node_id: &str, reason: &str) {
        warn!(swarm_id = %dag.id, node_id, reason, "node dispatch failed");
        let Some(node) = dag.node_mut(node_id) else {
            return;
        };
        node.task_id = None;
        if node.retries < node.max_retries {
            node.retries += 1;
            node.status = NodeStatus::Pending;
        } else {
            node.status = NodeStatus::Failed;
        }
    }

    /// Terminal success: synthesize the final result from sink-node outputs.
    async fn complete_graph(&self, dag: &mut SwarmDag) -> (String, String) {
        dag.status = SwarmStatus::Completed;
        dag.completed_at = Some(Utc::now());

        let sink_ids: Vec<String> = dag
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed && dag.successor_ids(&n.id).is_empty())
            .map(|n| n.id.clone())
            .collect();

        let mut parts = Vec::new();
        for id in sink_ids {
            if let Ok(Some(output)) = self.store.read_scratchpad(&dag.id, &id).await {
                let trimmed = output.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_owned());
                }
            }
        }
        if !parts.is_empty() {
            dag.final_result = Some(parts.join("\n\n"));
        }

        let done = dag.count_with_status(NodeStatus::Completed);
        info!(swarm_id = %dag.id, done, spent_usd = dag.budget.spent_usd, "swarm completed");
        (
            dag.initiator.clone(),
            format!(
                "Swarm \"{}\" completed: {done}/{} nodes, ${:.2} spent.",
                dag.name,
                dag.nodes.len(),
                dag.budget.spent_usd
            ),
        )
    }

    async fn persist(&self, dag: &SwarmDag) {
        // Persistence failures are logged and never block the tick.
        if let Err(e) = self.store.save_dag(dag).await {
            warn!(swarm_id = %dag.id, error = %e, "failed to persist swarm document");
        }
    }

    async fn send_notification(&self, initiator: &str, message: impl Into<String>) {
        let notifier = self.notifier.lock().await.clone();
        if let Some(notifier) = notifier {
            notifier.notify(initiator, &message.into()).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Completion hook
// ---------------------------------------------------------------------------

#[async_trait]
impl NodeCompletionHook for DagExecutor {
    /// Translate a terminal supervised task into node state: checkpoint and
    /// complete, retry, or fail -- always debiting the cost -- then re-tick.
    ///
    /// Idempotent: an already-completed node, a stale task id, or an
    /// inactive graph all no-op without double-counting cost.
    async fn on_node_complete(&self, task_id: &str, swarm_id: &str, node_id: &str, cost_usd: f64) {
        {
            let mut swarms = self.swarms.lock().await;
            let Some(dag) = swarms.get_mut(swarm_id) else {
                debug!(swarm_id, node_id, "completion for inactive swarm, ignoring");
                return;
            };

            let Some(node) = dag.node(node_id) else {
                warn!(swarm_id, node_id, "completion for unknown node");
                return;
            };
            if node.status == NodeStatus::Completed {
                return;
            }
            if node.task_id.as_deref() != Some(task_id) {
                debug!(swarm_id, node_id, task_id, "stale completion callback, ignoring");
                return;
            }

            let task_completed = self
                .supervisor
                .get(task_id)
                .await
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false);

            // Hash the scratchpad before re-borrowing the node mutably.
            let output_hash = if task_completed {
                let output = self
                    .store
                    .read_scratchpad(swarm_id, node_id)
                    .await
                    .unwrap_or_default()
                    .unwrap_or_default();
                Some(checkpoint_hash(output.as_bytes()))
            } else {
                None
            };

            let Some(node) = dag.node_mut(node_id) else {
                return;
            };
            match output_hash {
                Some(hash) => {
                    node.checkpoint = Some(Checkpoint {
                        completed_at: Utc::now(),
                        output_hash: hash,
                    });
                    node.status = NodeStatus::Completed;
                    node.cost_usd += cost_usd;
                    info!(swarm_id, node_id, cost_usd, "node completed");
                }
                None => {
                    node.task_id = None;
                    node.cost_usd += cost_usd;
                    if node.retries < node.max_retries {
                        node.retries += 1;
                        node.status = NodeStatus::Pending;
                        info!(
                            swarm_id,
                            node_id,
                            attempt = node.retries,
                            max = node.max_retries,
                            "node failed, will retry"
                        );
                    } else {
                        node.status = NodeStatus::Failed;
                        warn!(swarm_id, node_id, "node failed, retries exhausted");
                    }
                }
            }

            dag.budget.spent_usd += cost_usd;
            self.persist(dag).await;
        }

        self.tick(swarm_id).await;
    }
}

// ---------------------------------------------------------------------------
// Pure graph helpers
// ---------------------------------------------------------------------------

/// Seconds over the wall-clock limit, if exceeded.
fn wall_clock_overrun(dag: &SwarmDag, now: chrono::DateTime<Utc>) -> Option<u64> {
    let started = dag.budget.started_at?;
    let elapsed = (now - started).num_seconds().max(0) as u64;
    (elapsed > dag.budget.max_wall_clock_secs).then_some(elapsed)
}

/// Checkpointed nodes are already done; never re-dispatch them.
fn promote_checkpointed(dag: &mut SwarmDag) {
    for node in &mut dag.nodes {
        if node.checkpoint.is_some() && !node.status.is_terminal() {
            node.status = NodeStatus::Completed;
            node.task_id = None;
        }
    }
}

/// Pending nodes whose every predecessor is completed or skipped become
/// ready.
fn mark_ready(dag: &mut SwarmDag) {
    let eligible: Vec<String> = dag
        .nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Pending)
        .filter(|n| {
            dag.predecessor_ids(&n.id).iter().all(|pred_id| {
                dag.node(pred_id).is_some_and(|p| {
                    matches!(p.status, NodeStatus::Completed | NodeStatus::Skipped)
                })
            })
        })
        .map(|n| n.id.clone())
        .collect();

    for id in eligible {
        if let Some(node) = dag.node_mut(&id) {
            node.status = NodeStatus::Ready;
        }
    }
}

/// Transitively skip everything downstream of failed (and newly skipped)
/// nodes.
fn propagate_skips(dag: &mut SwarmDag) {
    let mut frontier: Vec<String> = dag
        .nodes
        .iter()
        .filter(|n| matches!(n.status, NodeStatus::Failed | NodeStatus::Skipped))
        .map(|n| n.id.clone())
        .collect();

    while let Some(id) = frontier.pop() {
        let successors: Vec<String> = dag
            .successor_ids(&id)
            .into_iter()
            .map(str::to_owned)
            .collect();
        for succ_id in successors {
            if let Some(succ) = dag.node_mut(&succ_id) {
                if !succ.status.is_terminal() {
                    succ.status = NodeStatus::Skipped;
                    succ.task_id = None;
                    frontier.push(succ_id);
                }
            }
        }
    }
}

/// A failed non-optional node with downstream dependents fails the graph.
fn find_critical_failure(dag: &SwarmDag) -> Option<String> {
    dag.nodes
        .iter()
        .find(|n| {
            n.status == NodeStatus::Failed && !n.optional && !dag.successor_ids(&n.id).is_empty()
        })
        .map(|n| n.label.clone())
}

/// Graph-level failure; emits the single terminal notification payload.
fn fail_graph(dag: &mut SwarmDag, error: String) -> (String, String) {
    warn!(swarm_id = %dag.id, error = %error, "swarm failed");
    dag.status = SwarmStatus::Failed;
    dag.error = Some(error.clone());
    dag.completed_at = Some(Utc::now());
    (
        dag.initiator.clone(),
        format!("Swarm \"{}\" failed: {error}", dag.name),
    )
}

/// First 16 hex digits of SHA-256 over the output bytes; empty output uses
/// the `"empty"` sentinel.
fn checkpoint_hash(output: &[u8]) -> String {
    if output.is_empty() {
        return "empty".to_owned();
    }
    let digest = Sha256::digest(output);
    hex::encode(digest)[..16].to_owned()
}
