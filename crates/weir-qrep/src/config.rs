//! Replication flow configuration
//!
//! [`QRepConfig`] drives one query-based replication flow (one source table
//! into one destination table). [`FlowConnectionConfigs`] drives the snapshot
//! orchestrator, which synthesizes one `QRepConfig` per table mapping.
//!
//! Zero-valued knobs mean "use the default"; read them through the accessor
//! methods rather than the raw fields.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap on concurrently running partition workers.
pub const DEFAULT_MAX_PARALLEL_WORKERS: u32 = 16;
/// Default pause between replication cycles when the source is quiet.
pub const DEFAULT_WAIT_BETWEEN_BATCHES_SECONDS: u32 = 5;
/// Default number of tables cloned in parallel during an initial snapshot.
pub const DEFAULT_SNAPSHOT_TABLES_IN_PARALLEL: u32 = 1;
/// Default per-table worker cap during an initial snapshot.
pub const DEFAULT_SNAPSHOT_MAX_PARALLEL_WORKERS: u32 = 8;
/// Default partition sizing for initial snapshot clones.
pub const DEFAULT_SNAPSHOT_ROWS_PER_PARTITION: u32 = 250_000;

/// Suffix of the shadow table written during a full resync.
pub const RESYNC_TABLE_SUFFIX: &str = "_weir_resync";

/// How replicated rows are applied at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QRepWriteType {
    #[default]
    Append,
    Overwrite,
    Upsert,
}

/// Write mode plus the key columns upserts deduplicate on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QRepWriteMode {
    pub write_type: QRepWriteType,
    #[serde(default)]
    pub upsert_key_columns: Vec<String>,
}

impl QRepWriteMode {
    pub fn append() -> Self {
        Self::default()
    }

    pub fn overwrite() -> Self {
        Self {
            write_type: QRepWriteType::Overwrite,
            upsert_key_columns: Vec::new(),
        }
    }

    pub fn upsert(key_columns: Vec<String>) -> Self {
        Self {
            write_type: QRepWriteType::Upsert,
            upsert_key_columns: key_columns,
        }
    }
}

/// One source-to-destination table pairing within a snapshot flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table_identifier: String,
    pub destination_table_identifier: String,
    /// Watermark-typed column partitions are carved on; empty forces
    /// full-table partitioning.
    #[serde(default)]
    pub partition_key: String,
    /// Columns excluded from the projection.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Explicit column list, when the projection is narrowed upstream.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl TableMapping {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source_table_identifier: source.into(),
            destination_table_identifier: destination.into(),
            ..Default::default()
        }
    }
}

/// Configuration of one query-based replication flow.
///
/// Immutable for the lifetime of a run, except for
/// `destination_table_identifier`, which the orchestrator swaps to the
/// shadow table name during the resync handshake and back after the rename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QRepConfig {
    pub flow_job_name: String,
    pub source_name: String,
    pub destination_name: String,

    /// Query template; `{{.start}}`/`{{.end}}` are bound per partition.
    pub query: String,
    pub watermark_table: String,
    pub watermark_column: String,
    pub destination_table_identifier: String,

    #[serde(default)]
    pub initial_copy_only: bool,
    #[serde(default)]
    pub dst_table_full_resync: bool,
    #[serde(default)]
    pub setup_watermark_table_on_destination: bool,
    #[serde(default)]
    pub write_mode: QRepWriteMode,

    /// 0 means [`DEFAULT_MAX_PARALLEL_WORKERS`].
    #[serde(default)]
    pub max_parallel_workers: u32,
    /// 0 means [`DEFAULT_WAIT_BETWEEN_BATCHES_SECONDS`].
    #[serde(default)]
    pub wait_between_batches_seconds: u32,
    /// 0 means [`DEFAULT_SNAPSHOT_ROWS_PER_PARTITION`].
    #[serde(default)]
    pub num_rows_per_partition: u32,

    /// Exported snapshot the partition reads run under, if any.
    #[serde(default)]
    pub snapshot_name: String,
    #[serde(default)]
    pub staging_path: String,
    #[serde(default)]
    pub synced_at_col_name: String,
    #[serde(default)]
    pub soft_delete_col_name: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default)]
    pub parent_mirror_name: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl QRepConfig {
    /// Worker cap with the default applied.
    pub fn max_parallel_workers(&self) -> usize {
        if self.max_parallel_workers > 0 {
            self.max_parallel_workers as usize
        } else {
            DEFAULT_MAX_PARALLEL_WORKERS as usize
        }
    }

    /// Between-cycle wait with the default applied.
    pub fn wait_between_batches(&self) -> Duration {
        let secs = if self.wait_between_batches_seconds > 0 {
            self.wait_between_batches_seconds
        } else {
            DEFAULT_WAIT_BETWEEN_BATCHES_SECONDS
        };
        Duration::from_secs(secs as u64)
    }

    /// Name of the resync shadow table for the current destination.
    pub fn resync_table_identifier(&self) -> String {
        format!("{}{}", self.destination_table_identifier, RESYNC_TABLE_SUFFIX)
    }

    /// Original destination name, with any resync suffix stripped.
    pub fn original_table_identifier(&self) -> String {
        self.destination_table_identifier
            .strip_suffix(RESYNC_TABLE_SUFFIX)
            .unwrap_or(&self.destination_table_identifier)
            .to_string()
    }
}

/// Configuration of an initial-snapshot flow over a set of tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConnectionConfigs {
    pub flow_job_name: String,
    pub source_name: String,
    pub destination_name: String,
    pub table_mappings: Vec<TableMapping>,

    #[serde(default)]
    pub do_initial_snapshot: bool,
    #[serde(default)]
    pub initial_snapshot_only: bool,

    /// Reuse an existing publication instead of creating one.
    #[serde(default)]
    pub publication_name: String,
    /// Reuse an existing replication slot instead of creating one.
    #[serde(default)]
    pub replication_slot_name: String,

    /// 0 means [`DEFAULT_SNAPSHOT_TABLES_IN_PARALLEL`].
    #[serde(default)]
    pub snapshot_num_tables_in_parallel: u32,
    /// Per-table worker cap; 0 means [`DEFAULT_SNAPSHOT_MAX_PARALLEL_WORKERS`].
    #[serde(default)]
    pub snapshot_max_parallel_workers: u32,
    /// 0 means [`DEFAULT_SNAPSHOT_ROWS_PER_PARTITION`].
    #[serde(default)]
    pub snapshot_num_rows_per_partition: u32,
    #[serde(default)]
    pub snapshot_staging_path: String,

    #[serde(default)]
    pub synced_at_col_name: String,
    #[serde(default)]
    pub soft_delete_col_name: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl FlowConnectionConfigs {
    pub fn snapshot_num_tables_in_parallel(&self) -> usize {
        self.snapshot_num_tables_in_parallel
            .max(DEFAULT_SNAPSHOT_TABLES_IN_PARALLEL) as usize
    }

    pub fn snapshot_max_parallel_workers(&self) -> u32 {
        if self.snapshot_max_parallel_workers > 0 {
            self.snapshot_max_parallel_workers
        } else {
            DEFAULT_SNAPSHOT_MAX_PARALLEL_WORKERS
        }
    }

    pub fn snapshot_num_rows_per_partition(&self) -> u32 {
        if self.snapshot_num_rows_per_partition > 0 {
            self.snapshot_num_rows_per_partition
        } else {
            DEFAULT_SNAPSHOT_ROWS_PER_PARTITION
        }
    }
}
