//! Plugin Instances
//!
//! A [`PluginInstance`] wraps one running plugin process: the capability it
//! dispensed, its connection, its metadata, and a watcher task that samples
//! the connection's health and publishes a [`CrashNotification`] when the
//! plugin dies.
//!
//! # Lifecycle
//!
//! `Loading` → `Running` once the watcher starts → `Stopped` after
//! [`PluginInstance::stop`]. A stopped instance is never restarted; the
//! manager launches a fresh one instead.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::PluginConnection;
use crate::info::{CrashNotification, PluginInfo};
use crate::notify::{CrashNotifier, stop_requested};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ─────────────────────────────────────────────────────────────────────────────
// Plugin State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PluginState {
    /// Connected, watcher not started yet
    Loading = 0,
    /// Watched for crashes
    Running = 1,
    /// Stopped and disconnected
    Stopped = 2,
}

impl PluginState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Loading,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Loading => write!(f, "loading"),
            PluginState::Running => write!(f, "running"),
            PluginState::Stopped => write!(f, "stopped"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Instance
// ─────────────────────────────────────────────────────────────────────────────

/// One running plugin process and its capability
pub struct PluginInstance<C> {
    generation: u64,
    capability: C,
    connection: Box<dyn PluginConnection>,
    info: PluginInfo,
    state: AtomicU8,
    /// Set to true to stop the watcher
    stop_tx: watch::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stopped: OnceCell<()>,
}

impl<C> PluginInstance<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        info: PluginInfo,
        capability: C,
        connection: Box<dyn PluginConnection>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::SeqCst),
            capability,
            connection,
            info,
            state: AtomicU8::new(PluginState::Loading as u8),
            stop_tx,
            watcher: Mutex::new(None),
            stopped: OnceCell::new(),
        })
    }

    /// Process-unique id of this instance
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn key(&self) -> &str {
        &self.info.key
    }

    /// Snapshot of the instance's metadata
    pub fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    pub fn restarts(&self) -> u32 {
        self.info.restarts
    }

    /// The capability the plugin dispensed
    pub fn capability(&self) -> &C {
        &self.capability
    }

    pub fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == PluginState::Running
    }

    /// Spawn the watcher task
    ///
    /// The watcher holds only a weak reference, so it never keeps an
    /// unregistered instance alive.
    pub(crate) fn start_watcher(
        self: &Arc<Self>,
        ping_interval: Duration,
        notifier: Arc<CrashNotifier>,
    ) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() || self.state() == PluginState::Stopped {
            return;
        }

        let stop_rx = self.stop_tx.subscribe();
        let instance = Arc::downgrade(self);
        *watcher = Some(tokio::spawn(watch_health(
            instance,
            stop_rx,
            ping_interval,
            notifier,
        )));

        let _ = self.state.compare_exchange(
            PluginState::Loading as u8,
            PluginState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        debug!(plugin = %self.key(), generation = self.generation, "Watcher started");
    }

    /// Stop the watcher, then close the connection
    ///
    /// Once this returns the instance can no longer report a crash.
    /// Concurrent and repeated calls all wait for the same stop.
    pub async fn stop(&self) {
        self.stopped.get_or_init(|| self.stop_inner()).await;
    }

    async fn stop_inner(&self) {
        self.state.store(PluginState::Stopped as u8, Ordering::SeqCst);
        self.stop_tx.send_replace(true);

        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                error!(plugin = %self.key(), error = ?e, "Watcher task panicked");
            }
        }

        self.connection.close().await;
        info!(plugin = %self.key(), generation = self.generation, "Plugin stopped");
    }
}

impl<C> std::fmt::Debug for PluginInstance<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("generation", &self.generation)
            .field("info", &self.info)
            .field("state", &PluginState::from_u8(self.state.load(Ordering::SeqCst)))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watcher Task
// ─────────────────────────────────────────────────────────────────────────────

/// Sample health every `ping_interval` until the plugin dies or is stopped
async fn watch_health<C>(
    instance: Weak<PluginInstance<C>>,
    mut stop_rx: watch::Receiver<bool>,
    ping_interval: Duration,
    notifier: Arc<CrashNotifier>,
) where
    C: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => return,
            _ = ticker.tick() => {}
        }

        let Some(instance) = instance.upgrade() else {
            return;
        };

        let healthy = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => return,
            healthy = instance.connection.is_healthy() => healthy,
        };
        if healthy {
            continue;
        }

        // A stop that raced the failed sample wins
        let stopped = *stop_rx.borrow();
        if stopped {
            return;
        }

        let notification = CrashNotification::new(&instance.info, instance.generation);
        drop(instance);

        warn!(
            plugin = %notification.key,
            restarts = notification.restarts,
            generation = notification.generation,
            "Plugin is unhealthy, reporting crash"
        );
        notifier.publish(notification, &mut stop_rx).await;
        return;
    }
}
