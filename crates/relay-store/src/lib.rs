//! Persistence layer for the relay's swarm orchestration core.
//!
//! Everything the relay knows lives as JSON under `<project>/data/` so a
//! crash never orphans work: swarm documents, the supervised-task registry,
//! pending replies, and per-session conversation buffers are all flushed
//! write-through on every state transition and reloaded at startup.

pub mod config;
pub mod models;
pub mod paths;
pub mod store;

pub use config::RelayConfig;
pub use paths::DataDir;
pub use store::{JsonStore, StoreError};
