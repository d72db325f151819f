//! Write-through JSON persistence.
//!
//! Every mutation in the core flushes the affected document through
//! [`JsonStore`] before the operation returns. Writes go to a sibling temp
//! file and are renamed into place, so a crash leaves either the old or the
//! new document, never a torn one.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::models::{
    ConversationEntry, HeartbeatState, PendingReply, SupervisedTask, SwarmDag, TaskRegistry,
};
use crate::paths::DataDir;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Handle on the `data/` tree; cheap to clone.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: DataDir,
}

impl JsonStore {
    pub fn new(dir: DataDir) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &DataDir {
        &self.dir
    }

    /// Create the directory skeleton. Idempotent.
    pub async fn init(&self) -> Result<(), StoreError> {
        for dir in [
            self.dir.root().to_path_buf(),
            self.dir.swarms_dir(),
            self.dir.conversations_dir(),
            self.dir.task_output_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    // -- generic helpers ----------------------------------------------------

    async fn write_doc<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(doc).map_err(|e| StoreError::json(path, e))?;

        // Temp-file + rename for whole-file atomicity.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::io(path, e))?;

        debug!(path = %path.display(), bytes = json.len(), "persisted document");
        Ok(())
    }

    async fn read_doc<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let doc = serde_json::from_str(&contents).map_err(|e| StoreError::json(path, e))?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    // -- swarm documents ----------------------------------------------------

    pub async fn save_dag(&self, dag: &SwarmDag) -> Result<(), StoreError> {
        self.write_doc(&self.dir.dag_file(&dag.id), dag).await
    }

    pub async fn load_dag(&self, swarm_id: &str) -> Result<Option<SwarmDag>, StoreError> {
        self.read_doc(&self.dir.dag_file(swarm_id)).await
    }

    /// Load every swarm document on disk, sorted by id (ids sort by
    /// creation time).
    pub async fn list_dags(&self) -> Result<Vec<SwarmDag>, StoreError> {
        let swarms_dir = self.dir.swarms_dir();
        let mut entries = match tokio::fs::read_dir(&swarms_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&swarms_dir, e)),
        };

        let mut dags = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&swarms_dir, e))?
        {
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Some(dag) = self.load_dag(&id).await? {
                dags.push(dag);
            }
        }
        dags.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(dags)
    }

    /// Read one node's scratchpad output, if the child produced any.
    pub async fn read_scratchpad(
        &self,
        swarm_id: &str,
        node_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let path = self.dir.scratchpad_file(swarm_id, node_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    // -- task registry ------------------------------------------------------

    pub async fn save_tasks(&self, registry: &TaskRegistry) -> Result<(), StoreError> {
        self.write_doc(&self.dir.tasks_file(), registry).await
    }

    pub async fn load_tasks(&self) -> Result<TaskRegistry, StoreError> {
        Ok(self
            .read_doc(&self.dir.tasks_file())
            .await?
            .unwrap_or_default())
    }

    pub async fn save_archive(&self, archive: &[SupervisedTask]) -> Result<(), StoreError> {
        self.write_doc(&self.dir.archive_file(), &archive).await
    }

    pub async fn load_archive(&self) -> Result<Vec<SupervisedTask>, StoreError> {
        Ok(self
            .read_doc(&self.dir.archive_file())
            .await?
            .unwrap_or_default())
    }

    // -- delivery queue -----------------------------------------------------

    pub async fn save_replies(&self, replies: &[PendingReply]) -> Result<(), StoreError> {
        self.write_doc(&self.dir.replies_file(), &replies).await
    }

    pub async fn load_replies(&self) -> Result<Vec<PendingReply>, StoreError> {
        Ok(self
            .read_doc(&self.dir.replies_file())
            .await?
            .unwrap_or_default())
    }

    // -- conversations ------------------------------------------------------

    pub async fn save_conversation(
        &self,
        session_key: &str,
        entries: &[ConversationEntry],
    ) -> Result<(), StoreError> {
        self.write_doc(&self.dir.conversation_file(session_key), &entries)
            .await
    }

    pub async fn load_conversation(
        &self,
        session_key: &str,
    ) -> Result<Vec<ConversationEntry>, StoreError> {
        Ok(self
            .read_doc(&self.dir.conversation_file(session_key))
            .await?
            .unwrap_or_default())
    }

    // -- heartbeat ----------------------------------------------------------

    pub async fn save_heartbeat(&self, state: &HeartbeatState) -> Result<(), StoreError> {
        self.write_doc(&self.dir.heartbeat_file(), state).await
    }

    pub async fn load_heartbeat(&self) -> Result<HeartbeatState, StoreError> {
        Ok(self
            .read_doc(&self.dir.heartbeat_file())
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use chrono::Utc;

    fn temp_store() -> (tempfile::TempDir, JsonStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonStore::new(DataDir::new(tmp.path().join("data")));
        (tmp, store)
    }

    #[tokio::test]
    async fn init_creates_skeleton() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();
        assert!(store.dir().swarms_dir().is_dir());
        assert!(store.dir().conversations_dir().is_dir());
        assert!(store.dir().task_output_dir().is_dir());
    }

    #[tokio::test]
    async fn missing_registry_loads_default() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();
        let reg = store.load_tasks().await.unwrap();
        assert!(reg.tasks.is_empty());
        assert_eq!(reg.total_completed, 0);
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();

        let mut reg = TaskRegistry::default();
        reg.total_completed = 3;
        reg.last_check_at = Some(Utc::now());
        store.save_tasks(&reg).await.unwrap();

        let back = store.load_tasks().await.unwrap();
        assert_eq!(back, reg);
    }

    #[tokio::test]
    async fn dag_round_trip_and_listing() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();

        let mut dag = minimal_dag("swarm-001");
        store.save_dag(&dag).await.unwrap();
        dag.id = "swarm-002".to_owned();
        store.save_dag(&dag).await.unwrap();

        let listed = store.list_dags().await.unwrap();
        assert_eq!(listed.len(), 2);
        // Sorted by id, which sorts by creation time.
        assert_eq!(listed[0].id, "swarm-001");
        assert_eq!(listed[1].id, "swarm-002");
    }

    #[tokio::test]
    async fn scratchpad_missing_is_none() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();
        assert!(store.read_scratchpad("s", "n").await.unwrap().is_none());

        let dir = store.dir().swarm_dir("s");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(store.dir().scratchpad_file("s", "n"), "out")
            .await
            .unwrap();
        assert_eq!(
            store.read_scratchpad("s", "n").await.unwrap().as_deref(),
            Some("out")
        );
    }

    #[tokio::test]
    async fn write_leaves_no_temp_file() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();
        store.save_tasks(&TaskRegistry::default()).await.unwrap();

        let tmp_path = store.dir().tasks_file().with_extension("json.tmp");
        assert!(!tmp_path.exists());
        assert!(store.dir().tasks_file().exists());
    }

    #[tokio::test]
    async fn conversation_key_mangling() {
        let (_tmp, store) = temp_store();
        store.init().await.unwrap();

        let entries = vec![ConversationEntry {
            role: ConversationRole::User,
            content: "hi".to_owned(),
            timestamp: Utc::now(),
            kind: Some(MessageKind::Text),
        }];
        store.save_conversation("tg:7:x", &entries).await.unwrap();
        assert!(store.dir().conversation_file("tg:7:x").exists());
        let back = store.load_conversation("tg:7:x").await.unwrap();
        assert_eq!(back, entries);
    }

    fn minimal_dag(id: &str) -> SwarmDag {
        SwarmDag {
            id: id.to_owned(),
            name: "t".to_owned(),
            created_at: Utc::now(),
            completed_at: None,
            status: SwarmStatus::Planning,
            nodes: vec![],
            edges: vec![],
            budget: BudgetEnvelope {
                max_cost_usd: 1.0,
                spent_usd: 0.0,
                max_concurrent: 1,
                max_nodes: 24,
                max_wall_clock_secs: 60,
                started_at: None,
            },
            initiator: "tests".to_owned(),
            error: None,
            final_result: None,
        }
    }
}
