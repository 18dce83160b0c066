//! Bridges connectivity changes into drain passes.

use std::sync::Weak;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{DurableQueue, Shared};
use crate::connectivity::ConnectivityState;

/// Spawn the task that watches `rx` and drains the queue whenever the device
/// goes from offline to online.
///
/// `was_connected` is the state `rx` was subscribed at, so changes made
/// before the task first runs still count as transitions. The task holds
/// only a weak reference and stops once the queue is dropped or the observer
/// goes away.
pub(super) fn spawn(
    shared: Weak<Shared>,
    mut rx: watch::Receiver<ConnectivityState>,
    mut was_connected: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let is_connected = rx.borrow_and_update().is_connected;
            let restored = is_connected && !was_connected;
            was_connected = is_connected;

            if !restored {
                trace!(is_connected, "connectivity change ignored");
                continue;
            }

            let Some(shared) = shared.upgrade() else {
                break;
            };
            DurableQueue::from_shared(shared)
                .on_connectivity_restored()
                .await;
        }

        debug!("connectivity dispatcher stopped");
    })
}
