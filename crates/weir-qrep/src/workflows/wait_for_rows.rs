//! Quiescence loop between replication cycles
//!
//! Polls the source for rows newer than the watermark cursor, sleeping
//! between probes. Each iteration is one simulated continue-as-new
//! incarnation, so a quiet source accumulates no history. In full-refresh
//! mode the loop returns after a single sleep regardless of change
//! presence, forcing a periodic full rewrite.

use std::time::Duration;

use tracing::{debug, info};

use crate::activity::ActivityOptions;
use crate::config::{QRepConfig, QRepWriteType};
use crate::context::FlowContext;
use crate::error::{FlowError, Result};
use crate::partition::QRepPartition;
use crate::settings::QREP_OVERWRITE_FULL_REFRESH_MODE;
use crate::workflows::FlowRuntime;

/// Wait until the source has rows newer than `last_partition`.
///
/// Returns once new rows are available, or after one sleep when
/// full-refresh mode is on. Runs as a child of the orchestrator with a
/// request-cancel close policy: a cancelled context surfaces as
/// [`FlowError::Cancelled`].
pub async fn wait_for_new_rows_workflow(
    runtime: FlowRuntime,
    ctx: FlowContext,
    config: QRepConfig,
    last_partition: QRepPartition,
) -> Result<()> {
    let options = ActivityOptions::unbounded().with_heartbeat(Duration::from_secs(60));

    let mut epoch: u64 = 0;
    loop {
        // one iteration per continue-as-new incarnation
        epoch += 1;
        ctx.check_cancelled()?;

        let has_new_rows = crate::activity::run_activity(&ctx, "qrep_has_new_rows", &options, |actx| {
            let activities = runtime.qrep.clone();
            let config = config.clone();
            let last = last_partition.clone();
            async move { activities.qrep_has_new_rows(&actx, &config, &last).await }
        })
        .await?;

        let full_refresh = config.write_mode.write_type == QRepWriteType::Overwrite
            && runtime
                .settings
                .get_bool(&config.env, QREP_OVERWRITE_FULL_REFRESH_MODE, false)
                .await?;

        if has_new_rows && !full_refresh {
            info!(flow = %config.flow_job_name, "new rows available, exiting the wait loop");
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(config.wait_between_batches()) => {}
            _ = ctx.cancelled() => return Err(FlowError::Cancelled),
        }

        if full_refresh {
            return Ok(());
        }
        debug!(flow = %config.flow_job_name, epoch, "no new rows, continuing the wait loop");
    }
}
