//! # Replication Workflows
//!
//! Durable orchestration layered on the activity interface:
//!
//! - [`qrep`] — the query-replication state machine: partition discovery,
//!   bounded fan-out, consolidation, resync rename, continue-as-new.
//! - [`wait_for_rows`] — the quiescence loop run between cycles.
//! - [`snapshot`] — initial-snapshot coordination over replication slots or
//!   exported transaction snapshots.
//!
//! Workflows simulate continue-as-new with a bounded state handoff: the
//! workflow function executes exactly one incarnation, and a driver loop
//! checkpoints [`crate::state::QRepFlowState`] through the state store
//! between incarnations.

use std::sync::Arc;

use crate::activities::{QRepActivities, SnapshotActivities};
use crate::settings::SettingOracle;
use crate::state::StateStore;

pub mod qrep;
pub mod snapshot;
pub mod wait_for_rows;

pub use qrep::{qrep_flow_workflow, qrep_partition_workflow, run_qrep_flow, FlowOutcome};
pub use snapshot::{snapshot_flow_workflow, SnapshotType};
pub use wait_for_rows::wait_for_new_rows_workflow;

/// Everything a workflow needs from its environment: the activity
/// implementations, the setting oracle, and durable state storage.
#[derive(Clone)]
pub struct FlowRuntime {
    pub(crate) qrep: Arc<dyn QRepActivities>,
    pub(crate) snapshot: Arc<dyn SnapshotActivities>,
    pub(crate) settings: SettingOracle,
    pub(crate) state_store: Arc<dyn StateStore>,
}

impl FlowRuntime {
    pub fn new(
        qrep: Arc<dyn QRepActivities>,
        snapshot: Arc<dyn SnapshotActivities>,
        settings: SettingOracle,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            qrep,
            snapshot,
            settings,
            state_store,
        }
    }

    pub fn qrep_activities(&self) -> &Arc<dyn QRepActivities> {
        &self.qrep
    }

    pub fn snapshot_activities(&self) -> &Arc<dyn SnapshotActivities> {
        &self.snapshot
    }

    pub fn settings(&self) -> &SettingOracle {
        &self.settings
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state_store
    }
}
