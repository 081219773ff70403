//! Shared test harness: a scriptable in-memory activity set that records
//! every orchestrator interaction.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use weir_qrep::{
    ActivityContext, CreateNormalizedTableInput, CreateTablesFromExistingInput, FlowError,
    FlowRuntime, FlowStatus, MemoryStateStore, PartitionRange, PeerType, QRepActivities,
    QRepConfig, QRepPartition, QRepPartitionBatch, RenameTableOption, RenameTablesInput, Result,
    SettingCatalog, SettingOracle, SetupReplicationInput, SetupTableSchemaInput, SlotInfo,
    SnapshotActivities, StateStore, TableSchema, TxSnapshotState,
};

/// Scriptable activity set. Behavior knobs are set before the workflow
/// runs; observations are asserted afterwards.
pub struct MockActivities {
    // scripted behavior
    partition_script: Mutex<VecDeque<Vec<QRepPartition>>>,
    pub has_new_rows: AtomicBool,
    pub peers: Mutex<HashMap<String, PeerType>>,
    pub schema: Mutex<TableSchema>,
    pub export_snapshot: Mutex<TxSnapshotState>,
    pub fail_batch_ids: Mutex<Vec<i32>>,
    pub fail_consolidate_once: AtomicBool,
    pub replicate_delay_ms: AtomicUsize,

    // recorded observations
    pub calls: Mutex<Vec<String>>,
    pub discovery_cursors: Mutex<Vec<QRepPartition>>,
    pub discovery_configs: Mutex<Vec<QRepConfig>>,
    pub replicated: Mutex<Vec<(String, QRepPartitionBatch)>>,
    pub created_from_existing: Mutex<Vec<(String, String)>>,
    pub renames: Mutex<Vec<RenameTableOption>>,
    pub mirrored_statuses: Mutex<Vec<FlowStatus>>,
    pub setup_replication_calls: AtomicUsize,
    pub slot_closed: AtomicBool,
    pub maintain_started: AtomicBool,
    pub replicate_started: Notify,
    concurrent_replicates: AtomicUsize,
    pub peak_concurrent_replicates: AtomicUsize,
}

impl MockActivities {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            partition_script: Mutex::new(VecDeque::new()),
            has_new_rows: AtomicBool::new(true),
            peers: Mutex::new(HashMap::new()),
            schema: Mutex::new(TableSchema {
                table_identifier: String::new(),
                columns: Vec::new(),
                primary_key_columns: vec!["id".to_string()],
            }),
            export_snapshot: Mutex::new(TxSnapshotState {
                snapshot_name: "exported-snapshot".to_string(),
                supports_tid_scans: true,
            }),
            fail_batch_ids: Mutex::new(Vec::new()),
            fail_consolidate_once: AtomicBool::new(false),
            replicate_delay_ms: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            discovery_cursors: Mutex::new(Vec::new()),
            discovery_configs: Mutex::new(Vec::new()),
            replicated: Mutex::new(Vec::new()),
            created_from_existing: Mutex::new(Vec::new()),
            renames: Mutex::new(Vec::new()),
            mirrored_statuses: Mutex::new(Vec::new()),
            setup_replication_calls: AtomicUsize::new(0),
            slot_closed: AtomicBool::new(false),
            maintain_started: AtomicBool::new(false),
            replicate_started: Notify::new(),
            concurrent_replicates: AtomicUsize::new(0),
            peak_concurrent_replicates: AtomicUsize::new(0),
        })
    }

    /// Queue one discovery result; an exhausted script discovers nothing.
    pub async fn push_partitions(&self, partitions: Vec<QRepPartition>) {
        self.partition_script.lock().await.push_back(partitions);
    }

    pub async fn set_peer(&self, name: &str, peer_type: PeerType) {
        self.peers.lock().await.insert(name.to_string(), peer_type);
    }

    pub async fn call_count(&self, name: &str) -> usize {
        self.calls.lock().await.iter().filter(|c| *c == name).count()
    }

    async fn log(&self, name: &str) {
        self.calls.lock().await.push(name.to_string());
    }
}

#[async_trait]
impl QRepActivities for MockActivities {
    async fn setup_qrep_metadata_tables(
        &self,
        _ctx: &ActivityContext,
        _config: &QRepConfig,
    ) -> Result<()> {
        self.log("setup_qrep_metadata_tables").await;
        Ok(())
    }

    async fn setup_table_schema(
        &self,
        _ctx: &ActivityContext,
        _input: &SetupTableSchemaInput,
    ) -> Result<()> {
        self.log("setup_table_schema").await;
        Ok(())
    }

    async fn create_normalized_table(
        &self,
        _ctx: &ActivityContext,
        _input: &CreateNormalizedTableInput,
    ) -> Result<()> {
        self.log("create_normalized_table").await;
        Ok(())
    }

    async fn get_qrep_partitions(
        &self,
        _ctx: &ActivityContext,
        config: &QRepConfig,
        last_partition: &QRepPartition,
        _run_id: &str,
    ) -> Result<Vec<QRepPartition>> {
        self.log("get_qrep_partitions").await;
        self.discovery_cursors.lock().await.push(last_partition.clone());
        self.discovery_configs.lock().await.push(config.clone());
        Ok(self
            .partition_script
            .lock()
            .await
            .pop_front()
            .unwrap_or_default())
    }

    async fn replicate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        batch: &QRepPartitionBatch,
        _run_id: &str,
    ) -> Result<()> {
        self.log("replicate_qrep_partitions").await;
        self.replicate_started.notify_waiters();

        let now = self.concurrent_replicates.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent_replicates.fetch_max(now, Ordering::SeqCst);

        let delay_ms = self.replicate_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            ctx.heartbeat.tick();
        }
        self.concurrent_replicates.fetch_sub(1, Ordering::SeqCst);

        if self.fail_batch_ids.lock().await.contains(&batch.batch_id) {
            return Err(FlowError::non_retryable(format!(
                "injected failure for batch {}",
                batch.batch_id
            )));
        }

        self.replicated
            .lock()
            .await
            .push((config.destination_table_identifier.clone(), batch.clone()));
        Ok(())
    }

    async fn consolidate_qrep_partitions(
        &self,
        _ctx: &ActivityContext,
        _config: &QRepConfig,
        _run_id: &str,
    ) -> Result<()> {
        self.log("consolidate_qrep_partitions").await;
        if self.fail_consolidate_once.swap(false, Ordering::SeqCst) {
            return Err(FlowError::non_retryable("injected consolidate failure"));
        }
        Ok(())
    }

    async fn cleanup_qrep_flow(&self, _ctx: &ActivityContext, _config: &QRepConfig) -> Result<()> {
        self.log("cleanup_qrep_flow").await;
        Ok(())
    }

    async fn create_tables_from_existing(
        &self,
        _ctx: &ActivityContext,
        input: &CreateTablesFromExistingInput,
    ) -> Result<()> {
        self.log("create_tables_from_existing").await;
        for (new, existing) in &input.new_to_existing_table_mapping {
            self.created_from_existing
                .lock()
                .await
                .push((new.clone(), existing.clone()));
        }
        Ok(())
    }

    async fn rename_tables(&self, _ctx: &ActivityContext, input: &RenameTablesInput) -> Result<()> {
        self.log("rename_tables").await;
        self.renames
            .lock()
            .await
            .extend(input.rename_table_options.iter().cloned());
        Ok(())
    }

    async fn qrep_has_new_rows(
        &self,
        _ctx: &ActivityContext,
        _config: &QRepConfig,
        _last_partition: &QRepPartition,
    ) -> Result<bool> {
        self.log("qrep_has_new_rows").await;
        Ok(self.has_new_rows.load(Ordering::SeqCst))
    }

    async fn get_peer_type(&self, _ctx: &ActivityContext, peer_name: &str) -> Result<PeerType> {
        self.log("get_peer_type").await;
        Ok(self
            .peers
            .lock()
            .await
            .get(peer_name)
            .copied()
            .unwrap_or(PeerType::Postgres))
    }

    async fn get_table_schema(
        &self,
        _ctx: &ActivityContext,
        _flow_name: &str,
        table_name: &str,
    ) -> Result<TableSchema> {
        self.log("get_table_schema").await;
        let mut schema = self.schema.lock().await.clone();
        schema.table_identifier = table_name.to_string();
        Ok(schema)
    }

    async fn sync_flow_status(
        &self,
        _ctx: &ActivityContext,
        _flow_name: &str,
        status: FlowStatus,
    ) -> Result<()> {
        self.mirrored_statuses.lock().await.push(status);
        Ok(())
    }
}

#[async_trait]
impl SnapshotActivities for MockActivities {
    async fn setup_replication(
        &self,
        _ctx: &ActivityContext,
        input: &SetupReplicationInput,
    ) -> Result<SlotInfo> {
        self.log("setup_replication").await;
        self.setup_replication_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SlotInfo {
            slot_name: format!("weir_{}", input.flow_job_name),
            snapshot_name: "slot-snapshot".to_string(),
            supports_tid_scans: true,
        })
    }

    async fn close_slot_keep_alive(&self, _ctx: &ActivityContext, _flow_name: &str) -> Result<()> {
        self.log("close_slot_keep_alive").await;
        self.slot_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn maintain_tx(
        &self,
        ctx: &ActivityContext,
        _session_id: &str,
        _peer_name: &str,
        _env: &HashMap<String, String>,
    ) -> Result<()> {
        self.log("maintain_tx").await;
        self.maintain_started.store(true, Ordering::SeqCst);
        // holds the exporting transaction until the session tears down
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.heartbeat.tick();
        }
    }

    async fn wait_for_export_snapshot(
        &self,
        _ctx: &ActivityContext,
        _session_id: &str,
    ) -> Result<TxSnapshotState> {
        self.log("wait_for_export_snapshot").await;
        Ok(self.export_snapshot.lock().await.clone())
    }
}

/// Runtime over the mock with an in-memory state store and no catalog.
pub fn mock_runtime(mock: &Arc<MockActivities>) -> FlowRuntime {
    FlowRuntime::new(
        mock.clone(),
        mock.clone(),
        SettingOracle::null(),
        Arc::new(MemoryStateStore::new()),
    )
}

/// Runtime with an explicit setting catalog and state store.
pub fn mock_runtime_with(
    mock: &Arc<MockActivities>,
    catalog: Arc<dyn SettingCatalog>,
    store: Arc<dyn StateStore>,
) -> FlowRuntime {
    FlowRuntime::new(mock.clone(), mock.clone(), SettingOracle::new(catalog), store)
}

/// Integer-range partition helper.
pub fn int_partition(id: &str, start: i64, end: i64) -> QRepPartition {
    QRepPartition::ranged(id, PartitionRange::Int { start, end })
}
