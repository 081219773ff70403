//! # Watermark Partitions
//!
//! A partition is a slice of the source table addressable by a closed range
//! over the watermark column: an identity integer, an updated-at timestamp,
//! or a physical tuple id when no watermark column is usable. Partitions are
//! opaque to the orchestrator; only the connector interprets the range.
//!
//! The cursor for "no progress yet" is a sentinel partition rather than an
//! `Option`, so it round-trips through persisted state unchanged across
//! versions. Use [`QRepPartition::is_initial`] instead of comparing ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partition id of the initial cursor (no progress yet).
pub const INITIAL_PARTITION_ID: &str = "not-applicable-partition";

/// Physical tuple id, for TID-scan partitioning of sources that expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId {
    pub block_number: u32,
    pub offset_number: u16,
}

/// Closed interval over the watermark column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionRange {
    Int { start: i64, end: i64 },
    Timestamp { start: DateTime<Utc>, end: DateTime<Utc> },
    Tid { start: TupleId, end: TupleId },
}

/// One replicable slice of the source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QRepPartition {
    pub partition_id: String,
    pub range: Option<PartitionRange>,
    #[serde(default)]
    pub full_table_partition: bool,
}

impl QRepPartition {
    /// The initial cursor: replication has not progressed yet.
    pub fn initial() -> Self {
        Self {
            partition_id: INITIAL_PARTITION_ID.to_string(),
            range: None,
            full_table_partition: false,
        }
    }

    /// Partition covering the whole table (no usable watermark column).
    pub fn full_table(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            range: None,
            full_table_partition: true,
        }
    }

    /// Partition over a watermark range.
    pub fn ranged(partition_id: impl Into<String>, range: PartitionRange) -> Self {
        Self {
            partition_id: partition_id.into(),
            range: Some(range),
            full_table_partition: false,
        }
    }

    /// True for the sentinel cursor.
    pub fn is_initial(&self) -> bool {
        self.partition_id == INITIAL_PARTITION_ID
    }
}

/// An ordered batch of partitions handed to one partition worker.
///
/// Batch ids are 1-based and dense within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QRepPartitionBatch {
    pub batch_id: i32,
    pub partitions: Vec<QRepPartition>,
}

/// Chunk a partition list into consecutive batches for fan-out.
///
/// With `max_parallel_workers == 1` everything lands in a single batch; with
/// fewer partitions than workers each partition gets its own batch. Order is
/// preserved and batch ids are assigned densely starting at 1.
pub fn chunk_partitions(
    partitions: Vec<QRepPartition>,
    max_parallel_workers: usize,
) -> Vec<QRepPartitionBatch> {
    if partitions.is_empty() {
        return Vec::new();
    }
    let chunk_size = (partitions.len() / max_parallel_workers.max(1)).max(1);

    partitions
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| QRepPartitionBatch {
            batch_id: (i + 1) as i32,
            partitions: chunk.to_vec(),
        })
        .collect()
}
