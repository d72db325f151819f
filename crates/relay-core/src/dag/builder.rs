//! DAG builder with validation.
//!
//! Accumulates node specifications and directed edges, then validates on
//! `build`: unique ids, known edge endpoints, the node cap, and acyclicity
//! via Kahn-style topological reachability. Pure construction, no I/O.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use rand::Rng;
use relay_store::models::{
    BudgetEnvelope, ModelTier, NodeKind, NodeStatus, SwarmDag, SwarmEdge, SwarmNode, SwarmStatus,
};

use crate::error::RelayError;

/// Hard ceiling on nodes per graph.
pub const DEFAULT_NODE_CAP: usize = 24;

/// Specification for one node, before the graph exists.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub prompt: String,
    pub model: Option<ModelTier>,
    pub max_retries: u32,
    pub timeout_secs: Option<u64>,
    pub optional: bool,
}

impl NodeSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        kind: NodeKind,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            prompt: prompt.into(),
            model: None,
            max_retries: 1,
            timeout_secs: None,
            optional: false,
        }
    }

    pub fn with_model(mut self, model: ModelTier) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Mark this node's failure as non-cascading.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Cost and scheduling limits supplied at build time.
#[derive(Debug, Clone)]
pub struct BudgetSpec {
    pub max_cost_usd: f64,
    pub max_concurrent: usize,
    pub max_wall_clock_secs: u64,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            max_cost_usd: 5.0,
            max_concurrent: 3,
            max_wall_clock_secs: 2 * 60 * 60,
        }
    }
}

/// Accumulates nodes and edges, validates, and emits a `planning` graph.
#[derive(Debug, Clone)]
pub struct DagBuilder {
    name: String,
    nodes: Vec<NodeSpec>,
    edges: Vec<SwarmEdge>,
    node_cap: usize,
}

impl DagBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            node_cap: DEFAULT_NODE_CAP,
        }
    }

    pub fn with_node_cap(mut self, cap: usize) -> Self {
        self.node_cap = cap;
        self
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> &mut Self {
        self.nodes.push(spec);
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(SwarmEdge {
            from: from.into(),
            to: to.into(),
            description: None,
        });
        self
    }

    pub fn add_edge_described(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        description: impl Into<String>,
    ) -> &mut Self {
        self.edges.push(SwarmEdge {
            from: from.into(),
            to: to.into(),
            description: Some(description.into()),
        });
        self
    }

    /// Validate and emit the graph.
    pub fn build(
        self,
        initiator: impl Into<String>,
        budget: BudgetSpec,
    ) -> Result<SwarmDag, RelayError> {
        if self.nodes.is_empty() {
            return Err(RelayError::Validation("graph has no nodes".to_owned()));
        }
        if self.nodes.len() > self.node_cap {
            return Err(RelayError::Validation(format!(
                "graph has {} nodes, cap is {}",
                self.nodes.len(),
                self.node_cap
            )));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(RelayError::Validation(format!(
                    "duplicate node id {:?}",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if edge.from == edge.to {
                return Err(RelayError::Validation(format!(
                    "self-edge on node {:?}",
                    edge.from
                )));
            }
            for endpoint in [&edge.from, &edge.to] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(RelayError::Validation(format!(
                        "edge references unknown node {endpoint:?}"
                    )));
                }
            }
        }

        check_for_cycles(&self.nodes, &self.edges)?;

        let swarm_id = generate_swarm_id();
        let nodes = self
            .nodes
            .into_iter()
            .map(|spec| SwarmNode {
                output_key: format!("{swarm_id}/{}", spec.id),
                id: spec.id,
                label: spec.label,
                kind: spec.kind,
                status: NodeStatus::Pending,
                prompt: spec.prompt,
                model: spec.model,
                task_id: None,
                checkpoint: None,
                retries: 0,
                max_retries: spec.max_retries,
                timeout_secs: spec.timeout_secs,
                optional: spec.optional,
                cost_usd: 0.0,
            })
            .collect::<Vec<_>>();

        let max_nodes = nodes.len();
        Ok(SwarmDag {
            id: swarm_id,
            name: self.name,
            created_at: Utc::now(),
            completed_at: None,
            status: SwarmStatus::Planning,
            nodes,
            edges: self.edges,
            budget: BudgetEnvelope {
                max_cost_usd: budget.max_cost_usd,
                spent_usd: 0.0,
                max_concurrent: budget.max_concurrent,
                max_nodes,
                max_wall_clock_secs: budget.max_wall_clock_secs,
                started_at: None,
            },
            initiator: initiator.into(),
            error: None,
            final_result: None,
        })
    }
}

/// Graph ids sort by creation time: millisecond timestamp plus a random
/// suffix to break ties.
fn generate_swarm_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let suffix: u16 = rand::rng().random();
    format!("swarm-{millis:013}-{suffix:04x}")
}

/// Detect cycles with Kahn's algorithm: if topological processing reaches
/// fewer nodes than exist, the remainder sits on a cycle.
fn check_for_cycles(nodes: &[NodeSpec], edges: &[SwarmEdge]) -> Result<(), RelayError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let n = nodes.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for edge in edges {
        let from = index[edge.from.as_str()];
        let to = index[edge.to.as_str()];
        adj[from].push(to);
        in_degree[to] += 1;
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut reached = 0usize;

    while let Some(i) = queue.pop_front() {
        reached += 1;
        for &next in &adj[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if reached < n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].id.as_str())
            .collect();
        return Err(RelayError::Validation(format!(
            "dependency cycle detected involving nodes: {}",
            stuck.join(", ")
        )));
    }

    Ok(())
}
