//! Flow control signals
//!
//! External controllers steer a running flow through the `flow-signal`
//! channel: pause, resume, or no-op. The orchestrator folds incoming
//! signals into a single active signal; pause is sticky until an explicit
//! resume, and pause takes effect at the next cycle boundary, never
//! mid-batch.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// Name of the signal channel.
pub const FLOW_SIGNAL_NAME: &str = "flow-signal";

/// Signals accepted by a running flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowSignal {
    #[default]
    Noop,
    Pause,
    Resume,
}

/// Fold an incoming signal into the active one.
///
/// Pause is sticky: only a resume clears it. Noop leaves the active signal
/// untouched.
pub fn fold_signal(active: FlowSignal, incoming: FlowSignal) -> FlowSignal {
    match incoming {
        FlowSignal::Pause => {
            if active != FlowSignal::Pause {
                info!("received pause signal");
            }
            FlowSignal::Pause
        }
        FlowSignal::Resume => {
            if active == FlowSignal::Pause {
                info!("received resume signal");
            }
            FlowSignal::Noop
        }
        FlowSignal::Noop => active,
    }
}

/// Create a connected signal channel pair.
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, SignalReceiver { rx })
}

/// Sending half of the flow signal channel.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<FlowSignal>,
}

impl SignalSender {
    /// Send a signal; dropped receivers are ignored (the flow is gone).
    pub fn send(&self, signal: FlowSignal) {
        let _ = self.tx.send(signal);
    }

    pub fn pause(&self) {
        self.send(FlowSignal::Pause);
    }

    pub fn resume(&self) {
        self.send(FlowSignal::Resume);
    }
}

/// Receiving half of the flow signal channel, owned by the orchestrator.
pub struct SignalReceiver {
    rx: mpsc::UnboundedReceiver<FlowSignal>,
}

impl SignalReceiver {
    /// Wait for the next signal. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<FlowSignal> {
        self.rx.recv().await
    }

    /// Wait for the next signal with a timeout; `None` after the full
    /// timeout elapses without one. A closed channel (every sender dropped)
    /// behaves like silence, not like an immediate return.
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<FlowSignal> {
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(signal)) => Some(signal),
            Ok(None) => {
                tokio::time::sleep_until(deadline).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<FlowSignal> {
        self.rx.try_recv().ok()
    }

    /// Fold every pending signal into `active` without blocking.
    ///
    /// The flush before a continuation point: the next incarnation sees the
    /// latest intent.
    pub fn drain(&mut self, mut active: FlowSignal) -> FlowSignal {
        while let Some(signal) = self.try_recv() {
            active = fold_signal(active, signal);
        }
        active
    }
}
