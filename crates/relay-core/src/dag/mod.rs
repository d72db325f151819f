//! Swarm DAG construction and execution.

pub mod builder;
pub mod executor;

pub use builder::{BudgetSpec, DagBuilder, NodeSpec};
pub use executor::{DagExecutor, SwarmNotifier};
