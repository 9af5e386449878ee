//! Restart supervisor
//!
//! One task per managed [`PluginManager`](crate::PluginManager). It drains
//! the crash queue one notification at a time and either relaunches the
//! plugin with its restart count bumped, or gives up on it once the count
//! reaches `max_restarts`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::info::CrashNotification;
use crate::manager::ManagerInner;
use crate::notify::stop_requested;

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of the supervisor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Running = 0,
    /// Terminal
    Stopped = 1,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared view of the supervisor's state
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SupervisorState::Running as u8))
    }

    pub(crate) fn get(&self) -> SupervisorState {
        match self.0.load(Ordering::SeqCst) {
            0 => SupervisorState::Running,
            _ => SupervisorState::Stopped,
        }
    }

    fn set_stopped(&self) {
        self.0.store(SupervisorState::Stopped as u8, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Restart Decision
// ─────────────────────────────────────────────────────────────────────────────

/// What to do about one crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    /// Relaunch with this restart count
    Restart { restarts: u32 },
    /// Restart limit reached
    Abandon,
}

impl RestartDecision {
    pub(crate) fn for_notification(notification: &CrashNotification, max_restarts: u32) -> Self {
        if notification.restarts >= max_restarts {
            Self::Abandon
        } else {
            Self::Restart {
                restarts: notification.restarts + 1,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor Task
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    state: Arc<StateCell>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub(crate) fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Signal the task and wait for it to finish
    pub(crate) async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.join.await {
            error!(error = ?e, "Supervisor task panicked");
        }
    }
}

pub(crate) fn spawn<C>(
    manager: Weak<ManagerInner<C>>,
    crashes: mpsc::Receiver<CrashNotification>,
) -> SupervisorHandle
where
    C: Clone + Send + Sync + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let state = Arc::new(StateCell::new());
    let join = tokio::spawn(run_supervisor(manager, crashes, stop_rx, Arc::clone(&state)));

    SupervisorHandle {
        stop_tx,
        state,
        join,
    }
}

async fn run_supervisor<C>(
    manager: Weak<ManagerInner<C>>,
    mut crashes: mpsc::Receiver<CrashNotification>,
    mut stop_rx: watch::Receiver<bool>,
    state: Arc<StateCell>,
) where
    C: Clone + Send + Sync + 'static,
{
    debug!("Supervisor started");

    loop {
        let notification = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => {
                debug!("Supervisor received stop signal");
                break;
            }
            notification = crashes.recv() => match notification {
                Some(notification) => notification,
                None => {
                    debug!("Crash queue closed");
                    break;
                }
            },
        };

        let Some(manager) = manager.upgrade() else {
            break;
        };
        handle_crash(&manager, notification).await;
    }

    state.set_stopped();
    debug!("Supervisor stopped");
}

/// Act on one crash notification while holding the plugin's key lock
pub(crate) async fn handle_crash<C>(manager: &ManagerInner<C>, notification: CrashNotification)
where
    C: Clone + Send + Sync + 'static,
{
    let key = notification.key.clone();
    let _guard = manager.lock_key(&key).await;

    if manager.is_closing() {
        debug!(plugin = %key, "Shutting down, ignoring crash");
        return;
    }

    let Some(dead) = manager
        .registry
        .get(&key)
        .filter(|current| current.generation() == notification.generation)
    else {
        debug!(
            plugin = %key,
            generation = notification.generation,
            "Crashed instance already replaced or stopped"
        );
        return;
    };

    let max_restarts = manager.config().restart.max_restarts;
    match RestartDecision::for_notification(&notification, max_restarts) {
        RestartDecision::Abandon => {
            error!(
                plugin = %key,
                restarts = notification.restarts,
                max_restarts,
                "Plugin restart limit reached, giving up"
            );
            manager.retire(&dead).await;
        }
        RestartDecision::Restart { restarts } => {
            manager.retire(&dead).await;
            let info = notification.to_info().with_restarts(restarts);
            match manager.start_locked(info).await {
                Ok(_) => info!(plugin = %key, restarts, "Plugin restarted after crash"),
                Err(e) => error!(plugin = %key, restarts, error = %e, "Failed to restart plugin"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::PluginManager;
    use crate::config::{ManagerConfig, RestartConfig};
    use crate::info::PluginInfo;
    use crate::test_support::{FakeConnector, GREETER, GreeterCap, wait_for};

    fn info(key: &str) -> PluginInfo {
        PluginInfo::new(key, format!("/opt/plugins/{key}"))
    }

    fn managed(connector: &FakeConnector, max_restarts: u32) -> PluginManager<GreeterCap> {
        let restart = RestartConfig::managed()
            .with_ping_interval(Duration::from_millis(10))
            .with_max_restarts(max_restarts);
        PluginManager::new(GREETER, Arc::new(connector.clone()), ManagerConfig::new(restart))
    }

    #[test]
    fn test_decision() {
        let mut notification = CrashNotification::new(&info("a"), 1);
        assert_eq!(
            RestartDecision::for_notification(&notification, 2),
            RestartDecision::Restart { restarts: 1 }
        );

        notification.restarts = 1;
        assert_eq!(
            RestartDecision::for_notification(&notification, 2),
            RestartDecision::Restart { restarts: 2 }
        );

        notification.restarts = 2;
        assert_eq!(
            RestartDecision::for_notification(&notification, 2),
            RestartDecision::Abandon
        );
    }

    #[tokio::test]
    async fn test_crashed_plugin_is_restarted() {
        let connector = FakeConnector::new();
        let manager = managed(&connector, 5);
        assert_eq!(manager.supervisor_state(), Some(SupervisorState::Running));

        manager.start_plugin(info("db")).await.unwrap();
        let first = connector.latest("db").unwrap();
        connector.crash("db");

        let restarted = wait_for(Duration::from_secs(5), || {
            manager
                .list_plugins()
                .iter()
                .any(|p| p.key == "db" && p.restarts == 1)
        })
        .await;
        assert!(restarted);
        assert!(first.is_closed());
        assert_eq!(connector.connect_count("db"), 2);
        assert_eq!(manager.get_plugin("db").unwrap().greet(), "hello from db");

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_limit_leaves_key_absent() {
        let connector = FakeConnector::new();
        let manager = managed(&connector, 2);
        let mut killed = manager.plugin_killed();

        manager.start_plugin(info("x")).await.unwrap();
        connector.break_plugin("x");

        // Two restarts, then the third crash is dropped
        for expected in 0..3 {
            let notification = tokio::time::timeout(Duration::from_secs(5), killed.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(notification.restarts, expected);
        }

        assert!(wait_for(Duration::from_secs(5), || manager.instance("x").is_none()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.get_plugin("x").unwrap_err().is_not_found());
        assert_eq!(connector.connect_count("x"), 3);
        assert_eq!(connector.live_count("x"), 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_notification_is_skipped() {
        let connector = FakeConnector::new();
        let manager = managed(&connector, 5);

        let first = manager.start_plugin(info("db")).await.unwrap();
        let stale = CrashNotification::new(&first.info(), first.generation());
        let current = manager.restart_plugin(info("db")).await.unwrap();

        handle_crash(&manager.inner, stale).await;

        let registered = manager.instance("db").unwrap();
        assert_eq!(registered.generation(), current.generation());
        assert_eq!(registered.restarts(), 1);
        assert_eq!(connector.connect_count("db"), 2);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_limit_notification_removes_plugin() {
        let connector = FakeConnector::new();
        let manager = managed(&connector, 2);

        let instance = manager.start_plugin(info("x").with_restarts(2)).await.unwrap();
        let notification = CrashNotification::new(&instance.info(), instance.generation());

        handle_crash(&manager.inner, notification).await;

        assert!(manager.instance("x").is_none());
        assert_eq!(connector.connect_count("x"), 1);
        assert!(connector.latest("x").unwrap().is_closed());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_supervisor_stops_with_manager() {
        let connector = FakeConnector::new();
        let manager = managed(&connector, 5);
        let state = manager.supervisor_state.clone().unwrap();

        manager.shutdown().await.unwrap();
        assert_eq!(state.get(), SupervisorState::Stopped);

        let dropped = managed(&connector, 5);
        let state = dropped.supervisor_state.clone().unwrap();
        drop(dropped);
        assert!(wait_for(Duration::from_secs(1), || state.get() == SupervisorState::Stopped).await);
    }
}
