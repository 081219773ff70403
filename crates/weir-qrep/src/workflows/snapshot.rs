//! # Snapshot Orchestrator
//!
//! Coordinates the initial copy of a set of tables before change streaming
//! takes over. Two modes:
//!
//! - **Slot**: establish a replication slot on the source (pinning an
//!   exported snapshot), clone every table under that snapshot with a
//!   bounded number of parallel clones, then release the slot keep-alive.
//!   The release runs on a disconnected context so it happens even when
//!   the flow is cancelled mid-clone.
//! - **Tx**: snapshot-only flows skip the slot. A keeper activity holds a
//!   repeatable-read transaction open while its exported snapshot feeds
//!   the clones; the session is torn down deterministically once cloning
//!   finishes.
//!
//! Each table clone is a child QRep flow with `initial_copy_only` set,
//! partitioned on the mapping's partition key (defaulting to the physical
//! row id when the source supports TID scans).

use std::time::Duration;

use tracing::{error, info, warn};

use crate::activity::{run_activity, ActivityOptions, RetryPolicy};
use crate::activities::{PeerType, SetupReplicationInput, SlotInfo, TableSchema, TxSnapshotState};
use crate::config::{FlowConnectionConfigs, QRepConfig, QRepWriteMode, TableMapping};
use crate::context::{sanitize_workflow_id, FlowContext};
use crate::error::{FlowError, Result};
use crate::query::flow_queries;
use crate::signal::signal_channel;
use crate::state::QRepFlowState;
use crate::selector::BoundSelector;
use crate::workflows::qrep::run_qrep_flow;
use crate::workflows::FlowRuntime;

/// How the initial snapshot pins a consistent view of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Unknown,
    /// Replication slot with an exported snapshot.
    Slot,
    /// Exported repeatable-read transaction snapshot, no slot.
    Tx,
}

struct SnapshotFlowExecution<'a> {
    runtime: &'a FlowRuntime,
    ctx: &'a FlowContext,
    config: &'a FlowConnectionConfigs,
}

impl<'a> SnapshotFlowExecution<'a> {
    async fn setup_replication(&self) -> Result<SlotInfo> {
        info!(flow = %self.config.flow_job_name, "setting up replication on source");

        let options = ActivityOptions::new(Duration::from_secs(4 * 24 * 3600))
            .with_retry(RetryPolicy::bounded(20));

        let input = SetupReplicationInput {
            peer_name: self.config.source_name.clone(),
            flow_job_name: self.config.flow_job_name.clone(),
            table_name_mapping: self
                .config
                .table_mappings
                .iter()
                .map(|m| {
                    (
                        m.source_table_identifier.clone(),
                        m.destination_table_identifier.clone(),
                    )
                })
                .collect(),
            do_initial_snapshot: self.config.do_initial_snapshot,
            existing_publication_name: self.config.publication_name.clone(),
            existing_replication_slot_name: self.config.replication_slot_name.clone(),
            env: self.config.env.clone(),
        };

        let slot_info = run_activity(self.ctx, "setup_replication", &options, |actx| {
            let activities = self.runtime.snapshot.clone();
            let input = input.clone();
            async move { activities.setup_replication(&actx, &input).await }
        })
        .await?;

        info!(
            flow = %self.config.flow_job_name,
            slot = %slot_info.slot_name,
            snapshot = %slot_info.snapshot_name,
            "replication slot live on source"
        );
        Ok(slot_info)
    }

    /// Release the slot keep-alive. Callers pass a disconnected context when
    /// this must survive cancellation.
    async fn close_slot_keep_alive(&self, ctx: &FlowContext) -> Result<()> {
        info!(flow = %self.config.flow_job_name, "closing slot keep-alive");
        let options = ActivityOptions::new(Duration::from_secs(900));
        run_activity(ctx, "close_slot_keep_alive", &options, |actx| {
            let activities = self.runtime.snapshot.clone();
            let flow_name = self.config.flow_job_name.clone();
            async move { activities.close_slot_keep_alive(&actx, &flow_name).await }
        })
        .await?;
        info!(flow = %self.config.flow_job_name, "slot keep-alive closed");
        Ok(())
    }

    async fn load_table_schema(&self, table_name: &str) -> Result<TableSchema> {
        let options = ActivityOptions::new(Duration::from_secs(60));
        run_activity(self.ctx, "get_table_schema", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let flow_name = self.config.flow_job_name.clone();
            let table_name = table_name.to_string();
            async move {
                activities
                    .get_table_schema(&actx, &flow_name, &table_name)
                    .await
            }
        })
        .await
    }

    async fn get_peer_type(&self, peer_name: &str) -> Result<PeerType> {
        let options = ActivityOptions::new(Duration::from_secs(60));
        run_activity(self.ctx, "get_peer_type", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let peer_name = peer_name.to_string();
            async move { activities.get_peer_type(&actx, &peer_name).await }
        })
        .await
    }

    /// Build and enqueue the clone child flow for one table mapping.
    async fn clone_table(
        &self,
        selector: &mut BoundSelector,
        snapshot_name: &str,
        mapping: &TableMapping,
    ) -> Result<()> {
        let flow_name = &self.config.flow_job_name;
        let src_name = &mapping.source_table_identifier;
        let dst_name = &mapping.destination_table_identifier;

        let child_workflow_id = sanitize_workflow_id(&format!(
            "clone_{}_{}_{}",
            flow_name,
            src_name,
            self.ctx.run_id()
        ));
        info!(
            flow = %flow_name,
            source = %src_name,
            destination = %dst_name,
            child_workflow_id = %child_workflow_id,
            snapshot = snapshot_name,
            "starting table clone"
        );

        let mut table_schema: Option<TableSchema> = None;
        let source_type = self.get_peer_type(&self.config.source_name).await?;

        // column projection: everything, or the quoted schema minus excludes
        let projection = if mapping.exclude.is_empty() {
            "*".to_string()
        } else {
            let schema = self.load_table_schema(dst_name).await?;
            let quoted: Vec<String> = schema
                .columns
                .iter()
                .filter(|c| !mapping.exclude.contains(&c.name))
                .map(|c| quote_identifier(&c.name, source_type))
                .collect();
            table_schema = Some(schema);
            quoted.join(",")
        };

        let src_escaped = quote_table_identifier(src_name, source_type);
        let query = build_clone_query(&projection, &src_escaped, &mapping.partition_key);

        // destinations keyed by document id deduplicate the initial load
        // against later change streaming via upserts
        let mut write_mode = QRepWriteMode::append();
        if self.get_peer_type(&self.config.destination_name).await? == PeerType::Elasticsearch {
            let schema = match table_schema {
                Some(schema) => schema,
                None => self.load_table_schema(dst_name).await?,
            };
            write_mode = QRepWriteMode::upsert(schema.primary_key_columns);
        }

        let clone_config = QRepConfig {
            flow_job_name: child_workflow_id.clone(),
            source_name: self.config.source_name.clone(),
            destination_name: self.config.destination_name.clone(),
            query,
            watermark_table: src_name.clone(),
            watermark_column: mapping.partition_key.clone(),
            destination_table_identifier: dst_name.clone(),
            initial_copy_only: true,
            snapshot_name: snapshot_name.to_string(),
            num_rows_per_partition: self.config.snapshot_num_rows_per_partition(),
            max_parallel_workers: self.config.snapshot_max_parallel_workers(),
            staging_path: self.config.snapshot_staging_path.clone(),
            synced_at_col_name: self.config.synced_at_col_name.clone(),
            soft_delete_col_name: self.config.soft_delete_col_name.clone(),
            write_mode,
            parent_mirror_name: flow_name.clone(),
            exclude: mapping.exclude.clone(),
            columns: mapping.columns.clone(),
            script: self.config.script.clone(),
            system: self.config.system.clone(),
            version: self.config.version,
            env: self.config.env.clone(),
            ..Default::default()
        };

        let child_ctx = self.ctx.child(&child_workflow_id);
        let runtime = self.runtime.clone();
        selector.spawn_child(async move {
            run_clone_workflow(runtime, child_ctx, clone_config).await
        });
        Ok(())
    }

    async fn clone_tables(
        &self,
        snapshot_type: SnapshotType,
        slot_name: &str,
        snapshot_name: &str,
        supports_tid_scans: bool,
        max_parallel_clones: usize,
    ) -> Result<()> {
        match snapshot_type {
            SnapshotType::Slot => {
                info!(flow = %self.config.flow_job_name, slot = slot_name, snapshot = snapshot_name, "cloning tables for slot")
            }
            SnapshotType::Tx => {
                info!(flow = %self.config.flow_job_name, snapshot = snapshot_name, "cloning tables in tx snapshot mode")
            }
            SnapshotType::Unknown => {}
        }

        let default_partition_key = if supports_tid_scans {
            "ctid"
        } else {
            warn!(
                flow = %self.config.flow_job_name,
                "source does not support TID scans, may fall back to full table partitions"
            );
            ""
        };

        let mut selector = BoundSelector::new("clone-tables", max_parallel_clones);

        for mapping in &self.config.table_mappings {
            let mut mapping = mapping.clone();
            if mapping.partition_key.is_empty() {
                mapping.partition_key = default_partition_key.to_string();
            }
            // a clone that fails to start does not abort the sweep
            if let Err(e) = self.clone_table(&mut selector, snapshot_name, &mapping).await {
                error!(
                    flow = %self.config.flow_job_name,
                    source = %mapping.source_table_identifier,
                    "failed to start clone child workflow: {e}"
                );
            }
        }

        selector.wait().await?;
        info!(flow = %self.config.flow_job_name, "finished cloning tables");
        Ok(())
    }

    async fn clone_tables_with_slot(&self, num_tables_in_parallel: usize) -> Result<()> {
        let slot_info = self.setup_replication().await?;

        info!(flow = %self.config.flow_job_name, num_tables_in_parallel, "cloning tables in parallel");
        let clone_result = self
            .clone_tables(
                SnapshotType::Slot,
                &slot_info.slot_name,
                &slot_info.snapshot_name,
                slot_info.supports_tid_scans,
                num_tables_in_parallel,
            )
            .await;

        // slot release must happen even when cloning failed or was cancelled
        if let Err(e) = self.close_slot_keep_alive(&self.ctx.disconnected()).await {
            error!(flow = %self.config.flow_job_name, "failed to close slot keep-alive: {e}");
        }

        clone_result.map_err(|e| {
            error!(flow = %self.config.flow_job_name, "failed to clone tables: {e}");
            e
        })
    }

    /// Snapshot-only mode: a keeper transaction exports the snapshot and
    /// stays open until every clone is done.
    async fn clone_tables_with_tx_snapshot(&self, num_tables_in_parallel: usize) -> Result<()> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session_ctx = self
            .ctx
            .child(format!("snapshot-session-{}", self.config.flow_job_name));

        let keeper_options = ActivityOptions::unbounded()
            .with_heartbeat(Duration::from_secs(600));

        let mut keeper_handle = tokio::spawn({
            let runtime = self.runtime.clone();
            let session_ctx = session_ctx.clone();
            let options = keeper_options.clone();
            let session_id = session_id.clone();
            let source = self.config.source_name.clone();
            let env = self.config.env.clone();
            async move {
                run_activity(&session_ctx, "maintain_tx", &options, |actx| {
                    let activities = runtime.snapshot.clone();
                    let session_id = session_id.clone();
                    let source = source.clone();
                    let env = env.clone();
                    async move { activities.maintain_tx(&actx, &session_id, &source, &env).await }
                })
                .await
            }
        });

        let export = run_activity(self.ctx, "wait_for_export_snapshot", &keeper_options, |actx| {
            let activities = self.runtime.snapshot.clone();
            let session_id = session_id.clone();
            async move { activities.wait_for_export_snapshot(&actx, &session_id).await }
        });
        tokio::pin!(export);

        let snapshot_state: TxSnapshotState = tokio::select! {
            export_result = &mut export => {
                match export_result {
                    Ok(state) => state,
                    Err(e) => {
                        session_ctx.cancel();
                        let _ = keeper_handle.await;
                        return Err(e);
                    }
                }
            }
            keeper_result = &mut keeper_handle => {
                // the keeper must outlive the export; an early exit is fatal
                let err = match keeper_result {
                    Ok(Ok(())) => FlowError::non_retryable("snapshot keeper exited before export"),
                    Ok(Err(e)) => e,
                    Err(join_err) => {
                        FlowError::non_retryable(format!("snapshot keeper panicked: {join_err}"))
                    }
                };
                return Err(err);
            }
            _ = self.ctx.cancelled() => {
                session_ctx.cancel();
                let _ = keeper_handle.await;
                return Err(FlowError::Cancelled);
            }
        };

        let clone_result = self
            .clone_tables(
                SnapshotType::Tx,
                "",
                &snapshot_state.snapshot_name,
                snapshot_state.supports_tid_scans,
                num_tables_in_parallel,
            )
            .await;

        // session teardown releases the exporting transaction
        session_ctx.cancel();
        let _ = keeper_handle.await;

        clone_result
    }
}

/// Drive one table clone to completion as a child QRep flow.
async fn run_clone_workflow(
    runtime: FlowRuntime,
    ctx: FlowContext,
    config: QRepConfig,
) -> Result<()> {
    let (_signal_tx, mut signals) = signal_channel();
    let (queries, _handle) = flow_queries(&QRepFlowState::new());
    run_qrep_flow(&runtime, &ctx, config, &mut signals, &queries)
        .await
        .map(|_| ())
}

/// Quote one identifier for the source dialect.
fn quote_identifier(ident: &str, peer_type: PeerType) -> String {
    match peer_type {
        PeerType::MySql => format!("`{}`", ident.replace('`', "``")),
        _ => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

/// Quote a possibly schema-qualified table name for the source dialect.
fn quote_table_identifier(table: &str, peer_type: PeerType) -> String {
    table
        .split('.')
        .map(|part| quote_identifier(part, peer_type))
        .collect::<Vec<_>>()
        .join(".")
}

/// Build the per-table clone query. An empty partition key selects the
/// whole table; otherwise partitions bind the `{{.start}}`/`{{.end}}`
/// placeholders.
fn build_clone_query(projection: &str, escaped_table: &str, partition_key: &str) -> String {
    if partition_key.is_empty() {
        format!("SELECT {projection} FROM {escaped_table}")
    } else {
        format!(
            "SELECT {projection} FROM {escaped_table} WHERE {partition_key} BETWEEN {{{{.start}}}} AND {{{{.end}}}}"
        )
    }
}

/// Initial-snapshot workflow over every table mapping in `config`.
///
/// Without `do_initial_snapshot` this only establishes the replication slot
/// for change streaming and releases its keep-alive.
pub async fn snapshot_flow_workflow(
    runtime: &FlowRuntime,
    ctx: &FlowContext,
    config: &FlowConnectionConfigs,
) -> Result<()> {
    let exec = SnapshotFlowExecution {
        runtime,
        ctx,
        config,
    };
    let num_tables_in_parallel = config.snapshot_num_tables_in_parallel();

    if !config.do_initial_snapshot {
        exec.setup_replication().await?;
        exec.close_slot_keep_alive(ctx).await?;
        return Ok(());
    }

    if config.initial_snapshot_only {
        exec.clone_tables_with_tx_snapshot(num_tables_in_parallel).await
    } else {
        exec.clone_tables_with_slot(num_tables_in_parallel).await
    }
}
