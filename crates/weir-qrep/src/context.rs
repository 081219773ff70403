//! Flow execution context
//!
//! A [`FlowContext`] carries the identity of a workflow execution (flow
//! name, stable run id) and its cancellation scope. Child contexts inherit
//! cancellation from their parent — cancelling an ancestor requests
//! cancellation of every descendant. Disconnected contexts share identity
//! but not cancellation, for cleanup that must run even after the parent
//! was cancelled.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{FlowError, Result};

/// Identity and cancellation scope of one workflow execution.
#[derive(Debug, Clone)]
pub struct FlowContext {
    flow_name: String,
    run_id: String,
    root: bool,
    cancel: CancellationToken,
}

impl FlowContext {
    /// Root context for a new flow execution.
    pub fn new(flow_name: impl Into<String>) -> Self {
        Self {
            flow_name: flow_name.into(),
            run_id: Uuid::new_v4().to_string(),
            root: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Flow name this context belongs to.
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Run id of the original execution; stable across continue-as-new.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// True when there is no parent workflow execution.
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Child context: fresh run id, cancellation chained to this context.
    pub fn child(&self, flow_name: impl Into<String>) -> Self {
        Self {
            flow_name: flow_name.into(),
            run_id: Uuid::new_v4().to_string(),
            root: false,
            cancel: self.cancel.child_token(),
        }
    }

    /// Same identity, detached cancellation. Cleanup run on a disconnected
    /// context proceeds even after this context was cancelled.
    pub fn disconnected(&self) -> Self {
        Self {
            flow_name: self.flow_name.clone(),
            run_id: self.run_id.clone(),
            root: self.root,
            cancel: CancellationToken::new(),
        }
    }

    /// Request cancellation of this context and all its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Error out if this context was cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Replace characters that are not legal in workflow ids with underscores.
pub fn sanitize_workflow_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
