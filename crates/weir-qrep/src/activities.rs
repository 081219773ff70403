//! # Collaborator Activity Interface
//!
//! Connectors, catalogs and staging stores appear to the orchestrator only
//! as named, retryable side effects with typed inputs and outputs. The
//! orchestrator never interprets partition ranges, generates SQL or touches
//! a wire protocol; it sequences these operations and owns the durable
//! state between them.
//!
//! Implementations must honor the documented idempotence contracts: the
//! orchestrator retries freely and will re-run setup steps after a crash.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityContext;
use crate::config::{QRepConfig, TableMapping};
use crate::error::Result;
use crate::partition::{QRepPartition, QRepPartitionBatch};
use crate::state::FlowStatus;

/// Peer database kinds the orchestrator distinguishes.
///
/// Only dialect quoting and the Elasticsearch upsert override depend on
/// this; everything else is connector-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    Postgres,
    MySql,
    ClickHouse,
    BigQuery,
    Snowflake,
    Elasticsearch,
    S3,
}

/// One column of a fetched table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub type_name: String,
}

/// Source table schema, as cached by `setup_table_schema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_identifier: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key_columns: Vec<String>,
}

/// Input for `setup_table_schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupTableSchemaInput {
    pub peer_name: String,
    pub table_mappings: Vec<TableMapping>,
    pub flow_name: String,
    pub system: String,
    pub env: HashMap<String, String>,
    pub version: u32,
}

/// Input for `create_normalized_table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNormalizedTableInput {
    pub peer_name: String,
    pub table_mappings: Vec<TableMapping>,
    pub synced_at_col_name: String,
    pub soft_delete_col_name: String,
    pub flow_name: String,
    pub env: HashMap<String, String>,
    pub is_resync: bool,
}

/// Input for `create_tables_from_existing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTablesFromExistingInput {
    pub flow_job_name: String,
    pub peer_name: String,
    /// new table name -> existing table whose schema it clones
    pub new_to_existing_table_mapping: HashMap<String, String>,
}

/// One rename within a `rename_tables` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameTableOption {
    pub current_name: String,
    pub new_name: String,
}

/// Input for `rename_tables`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameTablesInput {
    pub flow_job_name: String,
    pub peer_name: String,
    pub rename_table_options: Vec<RenameTableOption>,
}

/// Input for `setup_replication`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupReplicationInput {
    pub peer_name: String,
    pub flow_job_name: String,
    /// source table -> destination table
    pub table_name_mapping: HashMap<String, String>,
    pub do_initial_snapshot: bool,
    /// Reuse this publication instead of creating one, when non-empty.
    pub existing_publication_name: String,
    /// Reuse this replication slot instead of creating one, when non-empty.
    pub existing_replication_slot_name: String,
    pub env: HashMap<String, String>,
}

/// Replication slot established on the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_name: String,
    pub snapshot_name: String,
    pub supports_tid_scans: bool,
}

/// Exported transaction snapshot, for slot-less initial copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxSnapshotState {
    pub snapshot_name: String,
    pub supports_tid_scans: bool,
}

/// Operations backing the QRep orchestrator.
#[async_trait]
pub trait QRepActivities: Send + Sync {
    /// Create connector-side bookkeeping tables. Idempotent.
    async fn setup_qrep_metadata_tables(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
    ) -> Result<()>;

    /// Fetch and cache source schemas for the given mappings.
    async fn setup_table_schema(
        &self,
        ctx: &ActivityContext,
        input: &SetupTableSchemaInput,
    ) -> Result<()>;

    /// Create destination tables from cached schemas. Idempotent DDL.
    async fn create_normalized_table(
        &self,
        ctx: &ActivityContext,
        input: &CreateNormalizedTableInput,
    ) -> Result<()>;

    /// Discover partitions newer than `last_partition`. Deterministic for a
    /// given source snapshot; may be empty.
    async fn get_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last_partition: &QRepPartition,
        run_id: &str,
    ) -> Result<Vec<QRepPartition>>;

    /// Copy the rows of one partition batch. At-least-once; expected to
    /// heartbeat while streaming.
    async fn replicate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        batch: &QRepPartitionBatch,
        run_id: &str,
    ) -> Result<()>;

    /// Merge staged partitions into the destination table. No-op for
    /// destinations that write directly.
    async fn consolidate_qrep_partitions(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        run_id: &str,
    ) -> Result<()>;

    /// Tear down per-flow staging (e.g. objects under the staging prefix).
    /// Idempotent.
    async fn cleanup_qrep_flow(&self, ctx: &ActivityContext, config: &QRepConfig) -> Result<()>;

    /// Clone table schemas for the resync shadow table. Idempotent.
    async fn create_tables_from_existing(
        &self,
        ctx: &ActivityContext,
        input: &CreateTablesFromExistingInput,
    ) -> Result<()>;

    /// Rename tables, atomically where the destination supports it.
    async fn rename_tables(&self, ctx: &ActivityContext, input: &RenameTablesInput) -> Result<()>;

    /// Check whether rows newer than `last_partition` exist at the source.
    async fn qrep_has_new_rows(
        &self,
        ctx: &ActivityContext,
        config: &QRepConfig,
        last_partition: &QRepPartition,
    ) -> Result<bool>;

    /// Resolve the database kind of a configured peer.
    async fn get_peer_type(&self, ctx: &ActivityContext, peer_name: &str) -> Result<PeerType>;

    /// Load the cached schema of one table.
    async fn get_table_schema(
        &self,
        ctx: &ActivityContext,
        flow_name: &str,
        table_name: &str,
    ) -> Result<TableSchema>;

    /// Mirror a status transition into the catalog for external observers.
    async fn sync_flow_status(
        &self,
        ctx: &ActivityContext,
        flow_name: &str,
        status: FlowStatus,
    ) -> Result<()>;
}

/// Operations backing the snapshot orchestrator.
#[async_trait]
pub trait SnapshotActivities: Send + Sync {
    /// Establish (or adopt) a replication slot and export its snapshot.
    /// Long-running; keeps the slot alive until `close_slot_keep_alive`.
    async fn setup_replication(
        &self,
        ctx: &ActivityContext,
        input: &SetupReplicationInput,
    ) -> Result<SlotInfo>;

    /// Release the slot keep-alive. Idempotent; must also run on
    /// cancellation.
    async fn close_slot_keep_alive(&self, ctx: &ActivityContext, flow_name: &str) -> Result<()>;

    /// Hold the exporting transaction open until the session ends. Blocks;
    /// an early return is an error.
    async fn maintain_tx(
        &self,
        ctx: &ActivityContext,
        session_id: &str,
        peer_name: &str,
        env: &HashMap<String, String>,
    ) -> Result<()>;

    /// Wait until `maintain_tx` has exported its snapshot.
    async fn wait_for_export_snapshot(
        &self,
        ctx: &ActivityContext,
        session_id: &str,
    ) -> Result<TxSnapshotState>;
}
