//! Read-only flow queries
//!
//! Two queries are installed at the top of every cycle: `qrep-flow-state`
//! (the full state record) and `flow-status` (the status enum alone).
//! Readers get copy-out snapshots published at suspension points; they can
//! never observe a partial state update or mutate the flow.

use tokio::sync::watch;

use crate::state::{FlowStatus, QRepFlowState};

/// Query name for the full flow state.
pub const QREP_FLOW_STATE_QUERY: &str = "qrep-flow-state";
/// Query name for the current flow status.
pub const FLOW_STATUS_QUERY: &str = "flow-status";

/// Create a connected publisher/handle pair seeded with `initial`.
pub fn flow_queries(initial: &QRepFlowState) -> (FlowQueryPublisher, FlowQueryHandle) {
    let (tx, rx) = watch::channel(initial.clone());
    (FlowQueryPublisher { tx }, FlowQueryHandle { rx })
}

/// Publishing side, owned by the orchestrator.
pub struct FlowQueryPublisher {
    tx: watch::Sender<QRepFlowState>,
}

impl FlowQueryPublisher {
    /// Publish a point-in-time snapshot of the flow state.
    pub fn publish(&self, state: &QRepFlowState) {
        // no receivers is fine; nobody is querying
        let _ = self.tx.send(state.clone());
    }

    /// Create an additional read handle.
    pub fn handle(&self) -> FlowQueryHandle {
        FlowQueryHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reading side, handed to external observers.
#[derive(Clone)]
pub struct FlowQueryHandle {
    rx: watch::Receiver<QRepFlowState>,
}

impl FlowQueryHandle {
    /// `qrep-flow-state`: the last published state snapshot.
    pub fn qrep_flow_state(&self) -> QRepFlowState {
        self.rx.borrow().clone()
    }

    /// `flow-status`: the last published status.
    pub fn flow_status(&self) -> FlowStatus {
        self.rx.borrow().current_flow_status
    }
}
