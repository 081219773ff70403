//! # QRep Orchestrator
//!
//! The replication state machine. Each cycle:
//!
//! 1. publish the state/status queries and gate on pause
//! 2. set up destination watermark table and connector metadata
//! 3. create the resync shadow table when a resync is due
//! 4. select the cursor (full-refresh rewinds it to the sentinel)
//! 5. wait for new rows, listening for pause alongside
//! 6. discover partitions, fan them out to bounded partition workers
//! 7. consolidate staging, clean up, rename the shadow table back
//! 8. advance the cursor, drain signals, continue as new
//!
//! The cursor advances only after every partition worker of the cycle has
//! acknowledged completion; a crash mid-cycle therefore replays from the
//! previous cursor without double-advancing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{run_activity, ActivityOptions, RetryPolicy};
use crate::activities::{
    CreateNormalizedTableInput, CreateTablesFromExistingInput, RenameTableOption,
    RenameTablesInput, SetupTableSchemaInput,
};
use crate::config::{QRepConfig, QRepWriteType, TableMapping};
use crate::context::FlowContext;
use crate::error::{FlowError, Result};
use crate::partition::{chunk_partitions, QRepPartition};
use crate::query::FlowQueryPublisher;
use crate::settings::QREP_OVERWRITE_FULL_REFRESH_MODE;
use crate::signal::{fold_signal, FlowSignal, SignalReceiver};
use crate::state::{FlowStatus, QRepFlowState};
use crate::workflows::wait_for_rows::wait_for_new_rows_workflow;
use crate::workflows::FlowRuntime;

/// How long the pause gate blocks on the signal channel per tick.
const PAUSE_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one workflow incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Checkpoint the state and re-enter.
    ContinueAsNew,
    /// Terminal: the flow finished its work.
    Completed,
}

struct QRepFlowExecution<'a> {
    runtime: &'a FlowRuntime,
    ctx: &'a FlowContext,
    config: &'a mut QRepConfig,
    active_signal: FlowSignal,
}

impl<'a> QRepFlowExecution<'a> {
    fn new(runtime: &'a FlowRuntime, ctx: &'a FlowContext, config: &'a mut QRepConfig) -> Self {
        Self {
            runtime,
            ctx,
            config,
            active_signal: FlowSignal::Noop,
        }
    }

    async fn update_status(
        &self,
        queries: &FlowQueryPublisher,
        state: &mut QRepFlowState,
        status: FlowStatus,
    ) {
        state.current_flow_status = status;
        queries.publish(state);
        if self.ctx.is_root() {
            mirror_status_to_catalog(self.runtime, self.ctx, status).await;
        }
    }

    async fn setup_metadata_tables(&self) -> Result<()> {
        info!(flow = %self.config.flow_job_name, "setting up metadata tables");
        let options = ActivityOptions::new(Duration::from_secs(300));
        run_activity(self.ctx, "setup_qrep_metadata_tables", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let config = self.config.clone();
            async move { activities.setup_qrep_metadata_tables(&actx, &config).await }
        })
        .await
    }

    async fn setup_table_schema(&self, table_name: &str) -> Result<()> {
        info!(flow = %self.config.flow_job_name, table = table_name, "fetching table schema");
        let options = ActivityOptions::new(Duration::from_secs(300));
        let input = SetupTableSchemaInput {
            peer_name: self.config.source_name.clone(),
            table_mappings: vec![TableMapping::new(
                table_name,
                &self.config.destination_table_identifier,
            )],
            flow_name: self.config.flow_job_name.clone(),
            system: self.config.system.clone(),
            env: self.config.env.clone(),
            version: self.config.version,
        };
        run_activity(self.ctx, "setup_table_schema", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let input = input.clone();
            async move { activities.setup_table_schema(&actx, &input).await }
        })
        .await
    }

    async fn setup_watermark_table_on_destination(&self) -> Result<()> {
        if !self.config.setup_watermark_table_on_destination {
            return Ok(());
        }
        info!(flow = %self.config.flow_job_name, "setting up watermark table on destination");

        let watermark_table = self.config.watermark_table.clone();
        self.setup_table_schema(&watermark_table).await?;

        let options = ActivityOptions::new(Duration::from_secs(300));
        let input = CreateNormalizedTableInput {
            peer_name: self.config.destination_name.clone(),
            table_mappings: vec![TableMapping::new(
                &self.config.watermark_table,
                &self.config.destination_table_identifier,
            )],
            synced_at_col_name: self.config.synced_at_col_name.clone(),
            soft_delete_col_name: self.config.soft_delete_col_name.clone(),
            flow_name: self.config.flow_job_name.clone(),
            env: self.config.env.clone(),
            is_resync: self.config.dst_table_full_resync,
        };
        run_activity(self.ctx, "create_normalized_table", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let input = input.clone();
            async move { activities.create_normalized_table(&actx, &input).await }
        })
        .await?;

        info!(flow = %self.config.flow_job_name, "watermark table ready on destination");
        Ok(())
    }

    /// Redirect writes into a shadow table while a resync is due.
    async fn handle_table_creation_for_resync(&mut self, state: &QRepFlowState) -> Result<()> {
        if !(state.needs_resync && self.config.dst_table_full_resync) {
            return Ok(());
        }
        let shadow = self.config.resync_table_identifier();
        let options = ActivityOptions::new(Duration::from_secs(600))
            .with_heartbeat(Duration::from_secs(60));
        let input = CreateTablesFromExistingInput {
            flow_job_name: self.config.flow_job_name.clone(),
            peer_name: self.config.destination_name.clone(),
            new_to_existing_table_mapping: HashMap::from([(
                shadow.clone(),
                self.config.destination_table_identifier.clone(),
            )]),
        };
        run_activity(self.ctx, "create_tables_from_existing", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let input = input.clone();
            async move { activities.create_tables_from_existing(&actx, &input).await }
        })
        .await?;

        info!(flow = %self.config.flow_job_name, shadow = %shadow, "replicating into resync shadow table");
        self.config.destination_table_identifier = shadow;
        Ok(())
    }

    /// Swing the shadow table over the original and clear the resync flag.
    async fn handle_table_rename_for_resync(&mut self, state: &mut QRepFlowState) -> Result<()> {
        if state.needs_resync && self.config.dst_table_full_resync {
            let shadow = self.config.destination_table_identifier.clone();
            let original = self.config.original_table_identifier();

            self.setup_table_schema(&shadow).await?;

            let options = ActivityOptions::new(Duration::from_secs(1800))
                .with_heartbeat(Duration::from_secs(60));
            let input = RenameTablesInput {
                flow_job_name: self.config.flow_job_name.clone(),
                peer_name: self.config.destination_name.clone(),
                rename_table_options: vec![RenameTableOption {
                    current_name: shadow.clone(),
                    new_name: original.clone(),
                }],
            };
            run_activity(self.ctx, "rename_tables", &options, |actx| {
                let activities = self.runtime.qrep.clone();
                let input = input.clone();
                async move { activities.rename_tables(&actx, &input).await }
            })
            .await?;

            info!(flow = %self.config.flow_job_name, table = %original, "resync rename complete");
            self.config.destination_table_identifier = original;
        }
        state.needs_resync = false;
        Ok(())
    }

    async fn get_partitions(&self, last_partition: &QRepPartition) -> Result<Vec<QRepPartition>> {
        info!(flow = %self.config.flow_job_name, "fetching partitions to replicate");
        let options = ActivityOptions::new(Duration::from_secs(72 * 3600))
            .with_heartbeat(Duration::from_secs(60))
            .with_retry(RetryPolicy::partition());
        run_activity(self.ctx, "get_qrep_partitions", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let config = self.config.clone();
            let last = last_partition.clone();
            let run_id = self.ctx.run_id().to_string();
            async move {
                activities
                    .get_qrep_partitions(&actx, &config, &last, &run_id)
                    .await
            }
        })
        .await
    }

    /// Fan partition batches out to child partition workers and wait for
    /// all of them. The first failure is reported only after every sibling
    /// settles.
    async fn process_partitions(
        &self,
        max_parallel_workers: usize,
        partitions: Vec<QRepPartition>,
    ) -> Result<()> {
        if partitions.is_empty() {
            info!(flow = %self.config.flow_job_name, "no partitions to process");
            return Ok(());
        }

        let batches = chunk_partitions(partitions, max_parallel_workers);
        info!(flow = %self.config.flow_job_name, num_batches = batches.len(), "processing partitions in batches");

        let child_retry = RetryPolicy::bounded(20)
            .with_initial_interval(Duration::from_secs(1))
            .with_maximum_interval(Duration::from_secs(60));

        let mut children = Vec::with_capacity(batches.len());
        for batch in batches {
            let workflow_id = format!("qrep-part-{}-{}", self.config.flow_job_name, Uuid::new_v4());
            let child_ctx = self.ctx.child(&workflow_id);
            let runtime = self.runtime.clone();
            let config = self.config.clone();
            let run_id = self.ctx.run_id().to_string();
            let retry = child_retry.clone();

            children.push(tokio::spawn(async move {
                let mut attempt: u32 = 0;
                loop {
                    attempt += 1;
                    match qrep_partition_workflow(&runtime, &child_ctx, &config, &batch, &run_id)
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_cancellation() => return Err(e),
                        Err(e) if !e.is_retriable() || attempt >= retry.maximum_attempts => {
                            return Err(FlowError::child(workflow_id.clone(), e));
                        }
                        Err(e) => {
                            let delay = retry.backoff(attempt);
                            warn!(workflow_id = %workflow_id, attempt, "partition workflow failed, retrying: {e}");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = child_ctx.cancelled() => return Err(FlowError::Cancelled),
                            }
                        }
                    }
                }
            }));
        }

        let mut first_error = None;
        for handle in children {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(FlowError::non_retryable(format!(
                    "partition worker panicked: {join_err}"
                ))),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(flow = %self.config.flow_job_name, "all partition batches processed");
        Ok(())
    }

    /// Merge staged partitions and tear the staging area down.
    async fn consolidate_partitions(&self) -> Result<()> {
        let options = ActivityOptions::new(Duration::from_secs(24 * 3600))
            .with_heartbeat(Duration::from_secs(60));

        run_activity(self.ctx, "consolidate_qrep_partitions", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let config = self.config.clone();
            let run_id = self.ctx.run_id().to_string();
            async move {
                activities
                    .consolidate_qrep_partitions(&actx, &config, &run_id)
                    .await
            }
        })
        .await?;
        info!(flow = %self.config.flow_job_name, "partitions consolidated");

        run_activity(self.ctx, "cleanup_qrep_flow", &options, |actx| {
            let activities = self.runtime.qrep.clone();
            let config = self.config.clone();
            async move { activities.cleanup_qrep_flow(&actx, &config).await }
        })
        .await?;
        info!(flow = %self.config.flow_job_name, "flow staging cleaned up");
        Ok(())
    }

    /// Run the quiescence loop as a child, listening for signals alongside.
    /// A pause signal short-circuits the wait; the cycle then skips straight
    /// to its continuation point.
    async fn wait_for_new_rows(
        &mut self,
        signals: &mut SignalReceiver,
        last_partition: &QRepPartition,
    ) -> Result<()> {
        let child_ctx = self
            .ctx
            .child(format!("qrep-wait-{}", self.config.flow_job_name));
        let runtime = self.runtime.clone();
        let config = self.config.clone();
        let last = last_partition.clone();

        let mut handle = tokio::spawn({
            let child_ctx = child_ctx.clone();
            async move { wait_for_new_rows_workflow(runtime, child_ctx, config, last).await }
        });

        let mut signals_open = true;
        loop {
            tokio::select! {
                join = &mut handle => {
                    return match join {
                        Ok(result) => result,
                        Err(join_err) => Err(FlowError::non_retryable(format!(
                            "wait-for-rows worker panicked: {join_err}"
                        ))),
                    };
                }
                signal = signals.recv(), if signals_open => {
                    match signal {
                        Some(signal) => {
                            self.active_signal = fold_signal(self.active_signal, signal);
                            if self.active_signal == FlowSignal::Pause {
                                child_ctx.cancel();
                                let _ = handle.await;
                                return Ok(());
                            }
                        }
                        None => signals_open = false,
                    }
                }
                _ = self.ctx.cancelled() => {
                    child_ctx.cancel();
                    let _ = handle.await;
                    return Err(FlowError::Cancelled);
                }
            }
        }
    }
}

/// Best-effort catalog mirror of a status transition; only root executions
/// report, children inherit their parent's responsibility.
async fn mirror_status_to_catalog(runtime: &FlowRuntime, ctx: &FlowContext, status: FlowStatus) {
    let options =
        ActivityOptions::new(Duration::from_secs(60)).with_retry(RetryPolicy::bounded(1));
    let result = run_activity(ctx, "sync_flow_status", &options, |actx| {
        let activities = runtime.qrep.clone();
        let flow_name = ctx.flow_name().to_string();
        async move { activities.sync_flow_status(&actx, &flow_name, status).await }
    })
    .await;
    if let Err(e) = result {
        warn!(flow = ctx.flow_name(), ?status, "failed to mirror status to catalog: {e}");
    }
}

/// One incarnation of the QRep orchestrator.
///
/// Runs a single replication cycle against `state` and reports whether the
/// driver should continue as new or stop. `config` is mutated only by the
/// resync handshake and carries forward with the continuation.
pub async fn qrep_flow_workflow(
    runtime: &FlowRuntime,
    ctx: &FlowContext,
    config: &mut QRepConfig,
    state: &mut QRepFlowState,
    signals: &mut SignalReceiver,
    queries: &FlowQueryPublisher,
) -> Result<FlowOutcome> {
    queries.publish(state);

    if state.current_flow_status == FlowStatus::Completed {
        info!(flow = %config.flow_job_name, "flow already completed");
        return Ok(FlowOutcome::Completed);
    }

    let mut exec = QRepFlowExecution::new(runtime, ctx, config);

    // pause gate: block on the signal channel until resumed
    if matches!(
        state.current_flow_status,
        FlowStatus::Pausing | FlowStatus::Paused
    ) {
        let paused_at = Instant::now();
        exec.active_signal = FlowSignal::Pause;
        exec.update_status(queries, state, FlowStatus::Paused).await;

        while exec.active_signal == FlowSignal::Pause {
            info!(
                flow = %exec.config.flow_job_name,
                paused_secs = paused_at.elapsed().as_secs(),
                "mirror is paused"
            );
            tokio::select! {
                signal = signals.recv_timeout(PAUSE_RECV_TIMEOUT) => {
                    if let Some(signal) = signal {
                        exec.active_signal = fold_signal(exec.active_signal, signal);
                    }
                }
                _ = ctx.cancelled() => return Err(FlowError::Cancelled),
            }
        }
        exec.update_status(queries, state, FlowStatus::Running).await;
    }

    if state.current_flow_status == FlowStatus::Setup {
        exec.update_status(queries, state, FlowStatus::Running).await;
    }

    let max_parallel_workers = exec.config.max_parallel_workers();

    exec.setup_watermark_table_on_destination().await?;
    exec.setup_metadata_tables().await?;
    exec.handle_table_creation_for_resync(state).await?;

    // cursor selection; full-refresh overwrites rewind to the sentinel
    let mut full_refresh = false;
    let mut last_partition = state.last_partition.clone();
    if exec.config.write_mode.write_type == QRepWriteType::Overwrite {
        full_refresh = runtime
            .settings
            .get_bool(&exec.config.env, QREP_OVERWRITE_FULL_REFRESH_MODE, false)
            .await?;
        if full_refresh {
            last_partition = QRepPartition::initial();
        }
    }

    if !exec.config.initial_copy_only {
        exec.wait_for_new_rows(signals, &last_partition).await?;
    }

    if exec.active_signal != FlowSignal::Pause {
        let partitions = exec.get_partitions(&last_partition).await?;
        info!(flow = %exec.config.flow_job_name, num_partitions = partitions.len(), "partitions to replicate");

        let cycle_len = partitions.len() as u64;
        let cycle_last = partitions.last().cloned();

        exec.process_partitions(max_parallel_workers, partitions).await?;
        exec.consolidate_partitions().await?;
        exec.handle_table_rename_for_resync(state).await?;

        if exec.config.initial_copy_only {
            info!(flow = %exec.config.flow_job_name, "initial copy completed");
            exec.update_status(queries, state, FlowStatus::Completed).await;
            return Ok(FlowOutcome::ContinueAsNew);
        }

        state.num_partitions_processed += cycle_len;
        info!(
            flow = %exec.config.flow_job_name,
            processed = cycle_len,
            total_processed = state.num_partitions_processed,
            "partitions processed"
        );

        if let Some(last) = cycle_last {
            if !full_refresh {
                state.last_partition = last;
            }
        }
    }

    // flush pending signals; the next incarnation sees the latest intent
    exec.active_signal = signals.drain(exec.active_signal);

    info!(
        flow = %exec.config.flow_job_name,
        last_partition = %state.last_partition.partition_id,
        num_partitions_processed = state.num_partitions_processed,
        "continuing as new"
    );

    if exec.active_signal == FlowSignal::Pause {
        exec.update_status(queries, state, FlowStatus::Paused).await;
    } else {
        queries.publish(state);
    }
    Ok(FlowOutcome::ContinueAsNew)
}

/// Child workflow replicating one partition batch.
pub async fn qrep_partition_workflow(
    runtime: &FlowRuntime,
    ctx: &FlowContext,
    config: &QRepConfig,
    batch: &crate::partition::QRepPartitionBatch,
    run_id: &str,
) -> Result<()> {
    info!(
        flow = %config.flow_job_name,
        batch_id = batch.batch_id,
        num_partitions = batch.partitions.len(),
        "replicating partition batch"
    );
    let options = ActivityOptions::new(Duration::from_secs(120 * 3600))
        .with_heartbeat(Duration::from_secs(300))
        .with_retry(RetryPolicy::partition());
    run_activity(ctx, "replicate_qrep_partitions", &options, |actx| {
        let activities = runtime.qrep.clone();
        let config = config.clone();
        let batch = batch.clone();
        let run_id = run_id.to_string();
        async move {
            activities
                .replicate_qrep_partitions(&actx, &config, &batch, &run_id)
                .await
        }
    })
    .await
}

/// Drive a QRep flow through continue-as-new incarnations until it
/// completes or fails.
///
/// State is checkpointed through the runtime's state store at every
/// continuation. On failure the state keeps its last good cursor: the
/// failed status is published to the queries and mirrored to the catalog,
/// but not persisted, so the next run retries from the stored cursor.
pub async fn run_qrep_flow(
    runtime: &FlowRuntime,
    ctx: &FlowContext,
    mut config: QRepConfig,
    signals: &mut SignalReceiver,
    queries: &FlowQueryPublisher,
) -> Result<QRepFlowState> {
    let flow_name = config.flow_job_name.clone();
    let mut state = match runtime.state_store.load(&flow_name).await? {
        Some(state) => state,
        None => QRepFlowState::new(),
    };

    let mut epoch: u64 = 0;
    loop {
        epoch += 1;
        match qrep_flow_workflow(runtime, ctx, &mut config, &mut state, signals, queries).await {
            Ok(FlowOutcome::ContinueAsNew) => {
                runtime.state_store.save(&flow_name, &state).await?;
                debug!(flow = %flow_name, epoch, "checkpointed continue-as-new");
            }
            Ok(FlowOutcome::Completed) => {
                runtime.state_store.save(&flow_name, &state).await?;
                return Ok(state);
            }
            Err(e) => {
                let mut failed = state.clone();
                failed.current_flow_status = FlowStatus::Failed;
                queries.publish(&failed);
                if ctx.is_root() && !e.is_cancellation() {
                    mirror_status_to_catalog(runtime, ctx, FlowStatus::Failed).await;
                }
                return Err(e);
            }
        }
    }
}
