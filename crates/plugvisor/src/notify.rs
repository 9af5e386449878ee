//! Crash notification conduit
//!
//! Watchers publish here. The supervisor (when restarts are managed) reads a
//! bounded queue; external observers get a broadcast copy through
//! [`PluginManager::plugin_killed`](crate::PluginManager::plugin_killed).

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use crate::info::CrashNotification;

pub(crate) struct CrashNotifier {
    /// Queue to the supervisor, `None` when unmanaged or after close
    supervisor_tx: RwLock<Option<mpsc::Sender<CrashNotification>>>,

    /// Observer fan-out, `None` after close
    observers: RwLock<Option<broadcast::Sender<CrashNotification>>>,
}

impl CrashNotifier {
    /// Create a notifier, returning the supervisor's end when `managed`
    pub(crate) fn new(
        capacity: usize,
        managed: bool,
    ) -> (Self, Option<mpsc::Receiver<CrashNotification>>) {
        let (observers, _) = broadcast::channel(capacity);
        let (supervisor_tx, supervisor_rx) = if managed {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        (
            Self {
                supervisor_tx: RwLock::new(supervisor_tx),
                observers: RwLock::new(Some(observers)),
            },
            supervisor_rx,
        )
    }

    /// Observer receiver; already closed once the notifier is closed
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CrashNotification> {
        match self.observers.read().as_ref() {
            Some(observers) => observers.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Publish a crash, giving up if `stop_rx` fires first
    ///
    /// Returns false when the notification did not reach the supervisor
    /// queue (unmanaged, closed, or stopped while waiting for room).
    pub(crate) async fn publish(
        &self,
        notification: CrashNotification,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        if let Some(observers) = self.observers.read().as_ref() {
            let _ = observers.send(notification.clone());
        }

        let key = notification.key.clone();
        let Some(tx) = self.supervisor_tx.read().clone() else {
            debug!(plugin = %key, "No supervisor listening, crash not queued");
            return false;
        };

        tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => {
                debug!(plugin = %key, "Stopped while queueing crash");
                false
            }
            sent = tx.send(notification) => sent.is_ok(),
        }
    }

    /// Drop both senders so the supervisor and every observer see the close
    pub(crate) fn close(&self) {
        self.supervisor_tx.write().take();
        self.observers.write().take();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.supervisor_tx.read().is_none()
    }
}

/// Resolve once `stop_rx` holds true or its sender is gone
pub(crate) async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop_rx.borrow_and_update();
        if stopped || stop_rx.changed().await.is_err() {
            return;
        }
    }
}
