//! Upward event channel from data-plane components to the topology.
//!
//! PTY sessions and packet observers cannot hold a reference back into the
//! topology manager (that would be a cycle); instead they report lifecycle
//! events on this channel and the topology's listener task reacts.

use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// A capture process exhausted its restart budget.
    ObserverFailed {
        device: String,
        iface: String,
        reason: String,
    },
    /// A PTY child exited on its own (shell exit, namespace gone).
    SessionExited { device: String, channel: String },
}

pub type EventSender = mpsc::UnboundedSender<SystemEvent>;

pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<SystemEvent>) {
    mpsc::unbounded_channel()
}

/// Drain and log system events until all senders are gone.
///
/// The topology hands this its receiver at startup; table cleanup for the
/// reporting component already happened on the sender side, so the
/// listener's job is visibility, not mutation.
pub async fn run_listener(mut rx: mpsc::UnboundedReceiver<SystemEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SystemEvent::ObserverFailed {
                device,
                iface,
                reason,
            } => {
                warn!(device, iface, reason, "packet observer failed permanently");
            }
            SystemEvent::SessionExited { device, channel } => {
                info!(device, channel, "terminal session ended");
            }
        }
    }
}
