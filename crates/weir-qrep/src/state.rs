//! # Durable Flow State
//!
//! [`QRepFlowState`] is the watermark cursor plus progress counters a flow
//! hands itself across continue-as-new boundaries. It is exclusively owned
//! by the orchestrator; readers get copy-out snapshots through the query
//! handles in [`crate::query`].
//!
//! Persistence goes through the [`StateStore`] trait:
//!
//! | Store | Use case |
//! |-------|----------|
//! | [`MemoryStateStore`] | Testing, embedded runs |
//! | [`FileStateStore`] | Single-node production |
//!
//! The file store writes atomically (temp file + rename + fsync) so a crash
//! mid-save never leaves a torn state record behind.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};
use crate::partition::QRepPartition;

/// Lifecycle status of a replication flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Setup,
    Running,
    Pausing,
    Paused,
    Completed,
    Failed,
}

impl FlowStatus {
    /// Terminal states admit no further orchestration steps.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Durable state of one replication flow.
///
/// Field names are stable: this record round-trips across continue-as-new
/// boundaries and process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QRepFlowState {
    /// Watermark cursor; the sentinel partition until progress is made.
    pub last_partition: QRepPartition,
    /// Monotonically non-decreasing count of partitions replicated.
    pub num_partitions_processed: u64,
    /// True until the first successful cycle completes the rename protocol.
    pub needs_resync: bool,
    pub current_flow_status: FlowStatus,
}

impl QRepFlowState {
    /// Fresh state for a flow that has made no progress yet.
    pub fn new() -> Self {
        Self {
            last_partition: QRepPartition::initial(),
            num_partitions_processed: 0,
            needs_resync: true,
            current_flow_status: FlowStatus::Setup,
        }
    }
}

impl Default for QRepFlowState {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable storage for [`QRepFlowState`], keyed by flow name.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, flow_name: &str) -> Result<Option<QRepFlowState>>;
    async fn save(&self, flow_name: &str, state: &QRepFlowState) -> Result<()>;
    async fn delete(&self, flow_name: &str) -> Result<()>;
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, QRepFlowState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, flow_name: &str) -> Result<Option<QRepFlowState>> {
        Ok(self.states.read().await.get(flow_name).cloned())
    }

    async fn save(&self, flow_name: &str, state: &QRepFlowState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(flow_name.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, flow_name: &str) -> Result<()> {
        self.states.write().await.remove(flow_name);
        Ok(())
    }
}

/// File-based state store.
///
/// Persists one JSON file per flow under a directory:
/// ```text
/// state_dir/
///   <flow_name>.json
/// ```
pub struct FileStateStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, QRepFlowState>>,
}

impl FileStateStore {
    /// Create a new file state store, creating the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FlowError::state(format!("failed to create state directory: {e}")))?;
        Ok(Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_path(&self, flow_name: &str) -> PathBuf {
        // flow names can carry schema qualifiers; keep file names flat
        let safe: String = flow_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, flow_name: &str) -> Result<Option<QRepFlowState>> {
        if let Some(state) = self.cache.read().await.get(flow_name) {
            return Ok(Some(state.clone()));
        }

        let path = self.file_path(flow_name);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FlowError::state(format!(
                    "failed to read state file {}: {e}",
                    path.display()
                )))
            }
        };

        let state: QRepFlowState = serde_json::from_str(&content)
            .map_err(|e| FlowError::state(format!("corrupt state file {}: {e}", path.display())))?;

        self.cache
            .write()
            .await
            .insert(flow_name.to_string(), state.clone());
        debug!(flow_name, path = %path.display(), "loaded flow state");
        Ok(Some(state))
    }

    async fn save(&self, flow_name: &str, state: &QRepFlowState) -> Result<()> {
        let path = self.file_path(flow_name);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(state)?;

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| FlowError::state(format!("failed to create {}: {e}", tmp_path.display())))?;
        file.write_all(&content)
            .await
            .map_err(|e| FlowError::state(format!("failed to write state: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| FlowError::state(format!("failed to sync state: {e}")))?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| FlowError::state(format!("failed to commit state file: {e}")))?;

        self.cache
            .write()
            .await
            .insert(flow_name.to_string(), state.clone());
        debug!(flow_name, path = %path.display(), "saved flow state");
        Ok(())
    }

    async fn delete(&self, flow_name: &str) -> Result<()> {
        self.cache.write().await.remove(flow_name);
        let path = self.file_path(flow_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(flow_name, "failed to delete state file: {e}");
                Err(FlowError::state(format!("failed to delete state file: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionRange;

    fn sample_state() -> QRepFlowState {
        QRepFlowState {
            last_partition: QRepPartition::ranged(
                "p42",
                PartitionRange::Int { start: 100, end: 199 },
            ),
            num_partitions_processed: 42,
            needs_resync: false,
            current_flow_status: FlowStatus::Running,
        }
    }

    #[test]
    fn test_fresh_state() {
        let state = QRepFlowState::new();
        assert!(state.last_partition.is_initial());
        assert_eq!(state.num_partitions_processed, 0);
        assert!(state.needs_resync);
        assert_eq!(state.current_flow_status, FlowStatus::Setup);
    }

    #[test]
    fn test_status_terminality() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
        assert!(!FlowStatus::Paused.is_terminal());
    }

    #[test]
    fn test_state_serde_stable_field_names() {
        let json = serde_json::to_value(sample_state()).unwrap();
        assert!(json.get("LastPartition").is_some());
        assert!(json.get("NumPartitionsProcessed").is_some());
        assert!(json.get("NeedsResync").is_some());
        assert_eq!(json["CurrentFlowStatus"], "RUNNING");
    }

    #[test]
    fn test_state_round_trip_identity() {
        let state = sample_state();
        let json = serde_json::to_string(&state).unwrap();
        let back: QRepFlowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load("mirror_orders").await.unwrap().is_none());

        let state = sample_state();
        store.save("mirror_orders", &state).await.unwrap();
        assert_eq!(store.load("mirror_orders").await.unwrap(), Some(state));

        store.delete("mirror_orders").await.unwrap();
        assert!(store.load("mirror_orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();

        let state = sample_state();
        store.save("mirror_orders", &state).await.unwrap();

        // fresh store instance reads from disk, not cache
        let store2 = FileStateStore::new(dir.path()).await.unwrap();
        assert_eq!(store2.load("mirror_orders").await.unwrap(), Some(state));

        store2.delete("mirror_orders").await.unwrap();
        assert!(store2.load("mirror_orders").await.unwrap().is_none());
        // deleting again is fine
        store2.delete("mirror_orders").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_flow_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();

        let state = sample_state();
        store.save("clone_public.orders/v2", &state).await.unwrap();
        assert_eq!(
            store.load("clone_public.orders/v2").await.unwrap(),
            Some(state)
        );
    }
}
