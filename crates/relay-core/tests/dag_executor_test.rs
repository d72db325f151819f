//! End-to-end executor scenarios driven by scripted fake agents.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relay_core::dag::{BudgetSpec, DagBuilder, DagExecutor, NodeSpec};
use relay_core::harness::ClaudeHarness;
use relay_core::router::ModelRouter;
use relay_core::supervisor::{NodeCompletionHook, SupervisorConfig, TaskSupervisor};
use relay_store::models::{
    Checkpoint, NodeKind, NodeStatus, SwarmStatus, TaskStatus,
};
use relay_test_utils::{
    TempData, scripted_researcher, selectively_failing_researcher, write_script,
};

// ===========================================================================
// Test world
// ===========================================================================

struct TestWorld {
    data: TempData,
    supervisor: Arc<TaskSupervisor>,
    executor: Arc<DagExecutor>,
}

async fn build_world(data: TempData, agent: PathBuf) -> TestWorld {
    let harness = Arc::new(ClaudeHarness::with_binary(
        agent.to_string_lossy().into_owned(),
    ));
    let config = SupervisorConfig {
        watchdog_interval: Duration::from_millis(100),
        default_workdir: data.root.clone(),
        ..Default::default()
    };
    let supervisor = TaskSupervisor::new(Arc::clone(&data.store), harness, config);
    let executor = DagExecutor::new(
        Arc::clone(&data.store),
        Arc::clone(&supervisor),
        ModelRouter::default(),
    );
    executor.attach().await;
    TestWorld {
        data,
        supervisor,
        executor,
    }
}

async fn wait_terminal(executor: &DagExecutor, swarm_id: &str) -> relay_store::models::SwarmDag {
    for _ in 0..300 {
        if let Some(dag) = executor.get(swarm_id).await {
            if dag.status.is_terminal() {
                return dag;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("swarm {swarm_id} did not reach a terminal status in time");
}

fn research_node(id: &str, prompt: &str) -> NodeSpec {
    NodeSpec::new(id, id, NodeKind::Research, prompt)
}

// ===========================================================================
// S1 -- linear three-node success
// ===========================================================================

#[tokio::test]
async fn three_node_swarm_completes_with_checkpoints_and_enriched_prompts() {
    let data = TempData::new().await;
    let agent = scripted_researcher(&data.root, "agent.sh");
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("three-node");
    builder
        .add_node(research_node("A", "gather alpha"))
        .add_node(research_node("B", "gather beta"))
        .add_node(research_node("C", "combine everything"));
    builder.add_edge("A", "B").add_edge("A", "C").add_edge("B", "C");
    let dag = builder.build("tester", BudgetSpec::default()).unwrap();
    let swarm_id = world.executor.start(dag).await.unwrap();

    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Completed, "error: {:?}", done.error);

    // Three checkpoints, each a 16-hex-digit fingerprint.
    for node in &done.nodes {
        assert_eq!(node.status, NodeStatus::Completed, "node {}", node.id);
        let checkpoint = node.checkpoint.as_ref().expect("checkpoint");
        assert_eq!(checkpoint.output_hash.len(), 16);
        assert!(checkpoint.output_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    // C's enriched prompt carries both predecessor outputs.
    let tasks = world.supervisor.list().await;
    let task_c = tasks
        .iter()
        .find(|t| t.swarm.as_ref().is_some_and(|s| s.node_id == "C"))
        .expect("task for node C");
    let prompt_c = task_c.prompt.as_deref().unwrap();
    assert!(
        prompt_c.contains("## Input from \"A\":\n\nout-A"),
        "missing A block in: {prompt_c}"
    );
    assert!(
        prompt_c.contains("## Input from \"B\":\n\nout-B"),
        "missing B block in: {prompt_c}"
    );

    // Spent equals the sum of per-node costs.
    let node_sum: f64 = done.nodes.iter().map(|n| n.cost_usd).sum();
    assert!((done.budget.spent_usd - node_sum).abs() < 1e-9);
    assert!(done.budget.spent_usd > 0.0);
    assert!(done.budget.spent_usd <= done.budget.max_cost_usd);

    // Final result synthesized from the sink node's scratchpad.
    assert_eq!(done.final_result.as_deref(), Some("out-C"));

    // Scratchpads exist on disk.
    let out_a = world
        .data
        .store
        .read_scratchpad(&swarm_id, "A")
        .await
        .unwrap();
    assert_eq!(out_a.as_deref(), Some("out-A"));
}

// ===========================================================================
// S2 -- optional leaf failure does not cascade
// ===========================================================================

#[tokio::test]
async fn optional_leaf_failure_still_completes_graph() {
    let data = TempData::new().await;
    let agent = selectively_failing_researcher(&data.root, "agent.sh", "FORBIDDEN");
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("optional-leaf");
    builder
        .add_node(research_node("A", "gather alpha"))
        .add_node(research_node("B", "report beta"))
        .add_node(
            research_node("C", "touch the FORBIDDEN topic")
                .optional()
                .with_max_retries(0),
        );
    builder.add_edge("A", "B").add_edge("A", "C");
    let dag = builder.build("tester", BudgetSpec::default()).unwrap();
    let swarm_id = world.executor.start(dag).await.unwrap();

    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Completed, "error: {:?}", done.error);
    assert_eq!(done.node("A").unwrap().status, NodeStatus::Completed);
    assert_eq!(done.node("B").unwrap().status, NodeStatus::Completed);
    assert_eq!(done.node("C").unwrap().status, NodeStatus::Failed);
    // No downstream skip: C had no dependents.
    assert_eq!(done.count_with_status(NodeStatus::Skipped), 0);
}

// ===========================================================================
// S3 -- critical failure cascades
// ===========================================================================

#[tokio::test]
async fn critical_failure_skips_downstream_and_fails_graph() {
    let data = TempData::new().await;
    let agent = selectively_failing_researcher(&data.root, "agent.sh", "FORBIDDEN");
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("critical");
    builder
        .add_node(research_node("A", "gather alpha"))
        .add_node(research_node("B", "the FORBIDDEN middle step").with_max_retries(1))
        .add_node(research_node("C", "combine"));
    builder.add_edge("A", "B").add_edge("B", "C");
    let dag = builder.build("tester", BudgetSpec::default()).unwrap();
    let swarm_id = world.executor.start(dag).await.unwrap();

    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("B"));
    assert_eq!(done.node("A").unwrap().status, NodeStatus::Completed);
    let node_b = done.node("B").unwrap();
    assert_eq!(node_b.status, NodeStatus::Failed);
    // One retry was attempted with the identical prompt before giving up.
    assert_eq!(node_b.retries, 1);
    assert_eq!(done.node("C").unwrap().status, NodeStatus::Skipped);
}

// ===========================================================================
// Budget boundary -- the tick after the overrunning node fails the graph
// ===========================================================================

#[tokio::test]
async fn budget_exceedance_fails_graph_before_next_dispatch() {
    let data = TempData::new().await;
    // One result costs (50000 * 3.00 + 10000 * 15.00) / 1e6 = $0.30 on sonnet.
    let agent = write_script(
        &data.root,
        "expensive.sh",
        r#"#!/bin/sh
prompt="$2"
out=$(printf '%s' "$prompt" | grep -oE '[^ ]+\.md' | tail -n 1)
[ -n "$out" ] && printf 'pricey' > "$out"
echo '{"type":"result","resultText":"done","isError":false,"inputTokens":50000,"outputTokens":10000}'
exit 0
"#,
    );
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("budget-edge");
    // Models pinned so the router's budget-pressure downgrade does not
    // change the arithmetic under test.
    builder
        .add_node(
            research_node("A", "expensive first step").with_model(relay_store::models::ModelTier::Sonnet),
        )
        .add_node(
            research_node("B", "never reached").with_model(relay_store::models::ModelTier::Sonnet),
        );
    builder.add_edge("A", "B");
    let budget = BudgetSpec {
        max_cost_usd: 0.30,
        ..Default::default()
    };
    let dag = builder.build("tester", budget).unwrap();
    let swarm_id = world.executor.start(dag).await.unwrap();

    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("budget exceeded"));
    // A finished and was debited; B was never dispatched.
    assert_eq!(done.node("A").unwrap().status, NodeStatus::Completed);
    assert_eq!(done.node("B").unwrap().status, NodeStatus::Pending);
    assert!(
        !world
            .supervisor
            .list()
            .await
            .iter()
            .any(|t| t.swarm.as_ref().is_some_and(|s| s.node_id == "B")),
        "B must not have been dispatched"
    );
    assert!(done.budget.spent_usd >= done.budget.max_cost_usd);
}

// ===========================================================================
// S7 -- crash-recovery resume
// ===========================================================================

#[tokio::test]
async fn resume_promotes_checkpointed_node_and_redispatches_the_rest() {
    let data = TempData::new().await;
    let agent = scripted_researcher(&data.root, "agent.sh");

    // Fabricate the on-disk state a crash would leave behind: A checkpointed
    // mid-flight, B running with a dead child.
    let mut builder = DagBuilder::new("resumable");
    builder
        .add_node(research_node("A", "gather alpha"))
        .add_node(research_node("B", "combine"));
    builder.add_edge("A", "B");
    let mut dag = builder.build("tester", BudgetSpec::default()).unwrap();
    dag.status = SwarmStatus::Running;
    dag.budget.started_at = Some(chrono::Utc::now());
    let swarm_id = dag.id.clone();

    let checkpoint = Checkpoint {
        completed_at: chrono::Utc::now(),
        output_hash: "00112233aabbccdd".to_owned(),
    };
    {
        let node_a = dag.node_mut("A").unwrap();
        node_a.status = NodeStatus::Running;
        node_a.task_id = Some("task-from-before-the-crash".to_owned());
        node_a.checkpoint = Some(checkpoint.clone());
    }
    {
        let node_b = dag.node_mut("B").unwrap();
        node_b.status = NodeStatus::Running;
        node_b.task_id = Some("another-dead-task".to_owned());
    }
    data.store.save_dag(&dag).await.unwrap();

    // A's output survived the crash on disk.
    let scratch_a = data.store.dir().scratchpad_file(&swarm_id, "A");
    tokio::fs::create_dir_all(scratch_a.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&scratch_a, "out-A").await.unwrap();

    // "Restart": a fresh world over the same data dir.
    let world = build_world(data, agent).await;
    let resumed = world.executor.resume_from_disk().await.unwrap();
    assert_eq!(resumed, 1);
    world.executor.tick(&swarm_id).await;

    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Completed, "error: {:?}", done.error);

    // A was promoted, not re-dispatched: checkpoint untouched, no new task.
    assert_eq!(done.node("A").unwrap().checkpoint, Some(checkpoint));
    assert!(
        !world
            .supervisor
            .list()
            .await
            .iter()
            .any(|t| t.swarm.as_ref().is_some_and(|s| s.node_id == "A")),
        "A must not have been re-dispatched"
    );

    // B was re-dispatched from pending and completed for real.
    let node_b = done.node("B").unwrap();
    assert_eq!(node_b.status, NodeStatus::Completed);
    assert!(node_b.checkpoint.is_some());
    let task_b = world
        .supervisor
        .list()
        .await
        .into_iter()
        .find(|t| t.swarm.as_ref().is_some_and(|s| s.node_id == "B"))
        .expect("task for node B");
    assert_eq!(task_b.status, TaskStatus::Completed);
    // B saw A's checkpointed output in its enriched prompt.
    assert!(
        task_b
            .prompt
            .as_deref()
            .unwrap()
            .contains("## Input from \"A\":\n\nout-A")
    );
}

// ===========================================================================
// Idempotence and cancellation
// ===========================================================================

/// An agent that stalls when its prompt mentions SLOW, succeeds otherwise.
fn half_slow_agent(dir: &std::path::Path) -> PathBuf {
    write_script(
        dir,
        "half_slow.sh",
        r#"#!/bin/sh
prompt="$2"
case "$prompt" in
  *SLOW*) sleep 3600 ;;
esac
out=$(printf '%s' "$prompt" | grep -oE '[^ ]+\.md' | tail -n 1)
[ -n "$out" ] && printf 'fast-output' > "$out"
echo '{"type":"result","resultText":"done","isError":false,"inputTokens":1000,"outputTokens":500}'
exit 0
"#,
    )
}

#[tokio::test]
async fn duplicate_completion_is_a_no_op_and_cancel_skips_the_rest() {
    let data = TempData::new().await;
    let agent = half_slow_agent(&data.root);
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("dup-and-cancel");
    builder
        .add_node(research_node("A", "fast step"))
        .add_node(research_node("B", "SLOW step"));
    builder.add_edge("A", "B");
    let dag = builder.build("tester", BudgetSpec::default()).unwrap();
    let swarm_id = world.executor.start(dag).await.unwrap();

    // Wait until A completed while B keeps the graph active.
    let mut task_a_id = None;
    for _ in 0..200 {
        let dag = world.executor.get(&swarm_id).await.unwrap();
        if dag.node("A").unwrap().status == NodeStatus::Completed {
            task_a_id = world
                .supervisor
                .list()
                .await
                .into_iter()
                .find(|t| t.swarm.as_ref().is_some_and(|s| s.node_id == "A"))
                .map(|t| t.id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let task_a_id = task_a_id.expect("A did not complete in time");

    let before = world.executor.get(&swarm_id).await.unwrap();
    assert_eq!(before.status, SwarmStatus::Running);

    // A second completion callback for the already-completed node must not
    // double-count cost or redispatch.
    world
        .executor
        .on_node_complete(&task_a_id, &swarm_id, "A", 9.9)
        .await;
    let after = world.executor.get(&swarm_id).await.unwrap();
    assert_eq!(after.budget.spent_usd, before.budget.spent_usd);
    assert_eq!(
        after.node("A").unwrap().cost_usd,
        before.node("A").unwrap().cost_usd
    );

    // Re-ticking with no state change leaves the persisted document equal.
    let doc_before = tokio::fs::read_to_string(world.data.store.dir().dag_file(&swarm_id))
        .await
        .unwrap();
    world.executor.tick(&swarm_id).await;
    let doc_after = tokio::fs::read_to_string(world.data.store.dir().dag_file(&swarm_id))
        .await
        .unwrap();
    assert_eq!(doc_before, doc_after);

    // Cancel: B is skipped, its child terminated, the graph leaves the
    // active set but its document is retained.
    world.executor.cancel(&swarm_id).await.unwrap();
    let cancelled = world.executor.get(&swarm_id).await.unwrap();
    assert_eq!(cancelled.status, SwarmStatus::Cancelled);
    assert_eq!(cancelled.node("B").unwrap().status, NodeStatus::Skipped);
    assert_eq!(cancelled.node("A").unwrap().status, NodeStatus::Completed);

    let task_b = world
        .supervisor
        .list()
        .await
        .into_iter()
        .find(|t| t.swarm.as_ref().is_some_and(|s| s.node_id == "B"))
        .expect("task for node B");
    assert_eq!(task_b.status, TaskStatus::Failed);
    assert!(task_b.error.as_deref().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn retry_reruns_a_failed_graph_keeping_checkpoints() {
    let data = TempData::new().await;
    // Fails while a marker file exists, succeeds after it is removed.
    let marker = data.root.join("broken");
    std::fs::write(&marker, "x").unwrap();
    let agent = write_script(
        &data.root,
        "flaky.sh",
        &format!(
            r#"#!/bin/sh
prompt="$2"
case "$prompt" in
  *second*)
    if [ -e {marker} ]; then
      echo '{{"type":"result","resultText":"broken","isError":true}}'
      exit 1
    fi
    ;;
esac
out=$(printf '%s' "$prompt" | grep -oE '[^ ]+\.md' | tail -n 1)
[ -n "$out" ] && printf 'ok' > "$out"
echo '{{"type":"result","resultText":"done","isError":false,"inputTokens":1000,"outputTokens":500}}'
exit 0
"#,
            marker = marker.display()
        ),
    );
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("flaky");
    builder
        .add_node(research_node("first", "step one"))
        .add_node(research_node("second", "step two").with_max_retries(0));
    builder.add_edge("first", "second");
    let dag = builder.build("tester", BudgetSpec::default()).unwrap();
    let swarm_id = world.executor.start(dag).await.unwrap();

    let failed = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(failed.status, SwarmStatus::Failed);
    let first_checkpoint = failed.node("first").unwrap().checkpoint.clone();
    assert!(first_checkpoint.is_some());

    // Clear the fault and retry the whole graph.
    std::fs::remove_file(&marker).unwrap();
    world.executor.retry(&swarm_id).await.unwrap();

    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Completed, "error: {:?}", done.error);
    // The completed node kept its checkpoint and was not re-run.
    assert_eq!(done.node("first").unwrap().checkpoint, first_checkpoint);
    assert_eq!(done.node("second").unwrap().status, NodeStatus::Completed);
}

#[tokio::test]
async fn pause_blocks_ticks_until_resume() {
    let data = TempData::new().await;
    let agent = scripted_researcher(&data.root, "agent.sh");
    let world = build_world(data, agent).await;

    let mut builder = DagBuilder::new("pausable");
    builder.add_node(research_node("A", "only step"));
    let mut dag = builder.build("tester", BudgetSpec::default()).unwrap();
    // Keep the graph in planning; drive the lifecycle by hand so the pause
    // lands before any dispatch.
    dag.status = SwarmStatus::Running;
    dag.budget.started_at = Some(chrono::Utc::now());
    let swarm_id = dag.id.clone();
    world.data.store.save_dag(&dag).await.unwrap();
    let resumed = world.executor.resume_from_disk().await.unwrap();
    assert_eq!(resumed, 1);

    world.executor.pause(&swarm_id).await.unwrap();
    world.executor.tick(&swarm_id).await;
    let paused = world.executor.get(&swarm_id).await.unwrap();
    assert_eq!(paused.status, SwarmStatus::Paused);
    assert_eq!(paused.node("A").unwrap().status, NodeStatus::Pending);

    world.executor.resume(&swarm_id).await.unwrap();
    let done = wait_terminal(&world.executor, &swarm_id).await;
    assert_eq!(done.status, SwarmStatus::Completed);
}
