//! The on-disk layout under `<project>/data/`.
//!
//! ```text
//! data/
//!   tasks.json                     live supervised-task registry
//!   tasks-archive.json             bounded archive of terminal tasks
//!   swarms/<swarmId>/dag.json      one document per graph
//!   swarms/<swarmId>/<nodeId>.md   scratchpad output of a research child
//!   pending_replies.json           outbound delivery queue
//!   conversations/<session>.json   per-session ring buffer
//!   heartbeat-state.json           heartbeat rotation state
//!   task-output/<ts>.md            default output file for task intents
//! ```

use std::path::{Path, PathBuf};

/// Resolved handle on the `data/` root.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Wrap a `data/` root. Does not touch the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn archive_file(&self) -> PathBuf {
        self.root.join("tasks-archive.json")
    }

    pub fn replies_file(&self) -> PathBuf {
        self.root.join("pending_replies.json")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.root.join("heartbeat-state.json")
    }

    pub fn swarms_dir(&self) -> PathBuf {
        self.root.join("swarms")
    }

    pub fn swarm_dir(&self, swarm_id: &str) -> PathBuf {
        self.swarms_dir().join(swarm_id)
    }

    pub fn dag_file(&self, swarm_id: &str) -> PathBuf {
        self.swarm_dir(swarm_id).join("dag.json")
    }

    /// Scratchpad file for one node's output, content-addressed by
    /// `(swarm_id, node_id)`.
    pub fn scratchpad_file(&self, swarm_id: &str, node_id: &str) -> PathBuf {
        self.swarm_dir(swarm_id).join(format!("{node_id}.md"))
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join("conversations")
    }

    /// Per-session conversation file. Colons in the session key are replaced
    /// with dashes for filesystem safety.
    pub fn conversation_file(&self, session_key: &str) -> PathBuf {
        let safe = session_key.replace(':', "-");
        self.conversations_dir().join(format!("{safe}.json"))
    }

    pub fn task_output_dir(&self) -> PathBuf {
        self.root.join("task-output")
    }

    /// Default output file for a task intent that did not name one.
    pub fn default_task_output(&self, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
        self.task_output_dir()
            .join(format!("{}.md", now.format("%Y%m%dT%H%M%S%3f")))
    }
}
