//! # weir-qrep - Query-Based Replication Orchestration
//!
//! Durable, resumable control plane for copying rows from a source database
//! into a destination store. The source table is partitioned along a
//! watermark column and the partitions are driven through a bounded-parallel
//! pipeline of replication jobs. Connectors stay behind the activity
//! interface; this crate owns the state machine, the concurrency discipline
//! and the durable cursor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Snapshot Workflow   │  slot / tx-snapshot session
//! │  (initial copy)      │──────────┐
//! └──────────┬───────────┘          │ per table, bounded
//!            ▼                      ▼
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │   QRep Workflow      │◄──│   BoundSelector      │
//! │ partition → fan-out  │   │  ≤ N clones in-flight│
//! │ → consolidate → ...  │   └──────────────────────┘
//! └──────────┬───────────┘
//!            │ continue-as-new (QRepFlowState checkpoint)
//!            ▼
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │  Partition Workers   │   │  Wait-For-Rows Loop  │
//! │  ≤ K batches, retry  │   │  poll + sleep cycle  │
//! └──────────────────────┘   └──────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Durable cursor**: `QRepFlowState` checkpoints through a pluggable
//!   [`StateStore`] at every continue-as-new boundary
//! - **Bounded fan-out**: partition batches and table clones never exceed
//!   their parallelism caps
//! - **Pause/resume**: signals fold at cycle boundaries, never mid-batch
//! - **Resync protocol**: full reloads write a shadow table and swing it
//!   over the original atomically
//! - **Snapshot coordination**: replication-slot and exported-transaction
//!   initial copies, with deterministic slot release
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weir_qrep::{
//!     flow_queries, signal_channel, FlowContext, FlowRuntime, MemoryStateStore,
//!     QRepConfig, QRepFlowState, SettingOracle,
//! };
//!
//! let runtime = FlowRuntime::new(
//!     Arc::new(my_connector_activities),
//!     Arc::new(my_snapshot_activities),
//!     SettingOracle::null(),
//!     Arc::new(MemoryStateStore::new()),
//! );
//!
//! let config = QRepConfig {
//!     flow_job_name: "mirror_orders".into(),
//!     source_name: "pg_prod".into(),
//!     destination_name: "ch_analytics".into(),
//!     watermark_table: "public.orders".into(),
//!     watermark_column: "updated_at".into(),
//!     destination_table_identifier: "orders".into(),
//!     ..Default::default()
//! };
//!
//! let ctx = FlowContext::new(&config.flow_job_name);
//! let (signal_tx, mut signals) = signal_channel();
//! let (queries, query_handle) = flow_queries(&QRepFlowState::new());
//!
//! // pause later via signal_tx.pause(); observe via query_handle.flow_status()
//! weir_qrep::run_qrep_flow(&runtime, &ctx, config, &mut signals, &queries).await?;
//! ```

pub mod activities;
pub mod activity;
pub mod config;
pub mod context;
pub mod error;
pub mod partition;
pub mod query;
pub mod selector;
pub mod settings;
pub mod signal;
pub mod state;
pub mod workflows;

pub use activities::{
    ColumnSchema, CreateNormalizedTableInput, CreateTablesFromExistingInput, PeerType,
    QRepActivities, RenameTableOption, RenameTablesInput, SetupReplicationInput,
    SetupTableSchemaInput, SlotInfo, SnapshotActivities, TableSchema, TxSnapshotState,
};
pub use activity::{run_activity, ActivityContext, ActivityOptions, Heartbeat, RetryPolicy};
pub use config::{
    FlowConnectionConfigs, QRepConfig, QRepWriteMode, QRepWriteType, TableMapping,
    DEFAULT_MAX_PARALLEL_WORKERS, RESYNC_TABLE_SUFFIX,
};
pub use context::{sanitize_workflow_id, FlowContext};
pub use error::{ErrorKind, FlowError, Result};
pub use partition::{
    chunk_partitions, PartitionRange, QRepPartition, QRepPartitionBatch, TupleId,
    INITIAL_PARTITION_ID,
};
pub use query::{
    flow_queries, FlowQueryHandle, FlowQueryPublisher, FLOW_STATUS_QUERY, QREP_FLOW_STATE_QUERY,
};
pub use selector::BoundSelector;
pub use settings::{
    MemorySettingCatalog, NullSettingCatalog, SettingCatalog, SettingOracle,
    QREP_OVERWRITE_FULL_REFRESH_MODE,
};
pub use signal::{
    fold_signal, signal_channel, FlowSignal, SignalReceiver, SignalSender, FLOW_SIGNAL_NAME,
};
pub use state::{FileStateStore, FlowStatus, MemoryStateStore, QRepFlowState, StateStore};
pub use workflows::{
    qrep_flow_workflow, qrep_partition_workflow, run_qrep_flow, snapshot_flow_workflow,
    wait_for_new_rows_workflow, FlowOutcome, FlowRuntime, SnapshotType,
};
