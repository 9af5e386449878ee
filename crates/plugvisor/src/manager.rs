//! Plugin Manager
//!
//! Public façade over the registry, the crash notifier and the supervisor.
//! Every operation on one key (start, stop, restart, crash handling) runs
//! under that key's async lock, so multi-step sequences never interleave.
//! Different keys proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::connection::{Connector, PluginConnection};
use crate::error::{PluginError, PluginResult};
use crate::info::{CrashNotification, PluginInfo};
use crate::instance::PluginInstance;
use crate::notify::CrashNotifier;
use crate::registry::PluginRegistry;
use crate::supervisor::{self, SupervisorHandle, SupervisorState};

// ─────────────────────────────────────────────────────────────────────────────
// Key Locks
// ─────────────────────────────────────────────────────────────────────────────

/// One async mutex per plugin key
///
/// A key's slot lives only while some caller holds or waits on its lock.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<String, KeySlot>>,
}

#[derive(Default)]
struct KeySlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters
    users: usize,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let user = self.enter(key);
        let guard = Arc::clone(&user.lock).lock_owned().await;
        KeyGuard {
            _guard: guard,
            _user: user,
        }
    }

    fn enter(&self, key: &str) -> KeyUser<'_> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_default();
        slot.users += 1;
        KeyUser {
            locks: self,
            key: key.to_string(),
            lock: Arc::clone(&slot.lock),
        }
    }

    fn leave(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// One caller's claim on a key's slot, released on drop
struct KeyUser<'a> {
    locks: &'a KeyLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for KeyUser<'_> {
    fn drop(&mut self) {
        self.locks.leave(&self.key);
    }
}

/// Exclusive hold on one plugin key
pub(crate) struct KeyGuard<'a> {
    // Fields drop in order: unlock first, then leave the slot
    _guard: OwnedMutexGuard<()>,
    _user: KeyUser<'a>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────────────────

/// State shared between the manager and its supervisor task
pub(crate) struct ManagerInner<C> {
    name: String,
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    pub(crate) registry: PluginRegistry<C>,
    notifier: Arc<CrashNotifier>,
    key_locks: KeyLocks,
    closing: AtomicBool,
}

impl<C> ManagerInner<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        self.key_locks.lock(key).await
    }

    /// Connect, dispense and type-check one plugin
    async fn launch(&self, info: PluginInfo) -> PluginResult<Arc<PluginInstance<C>>> {
        let connection = self.connector.connect(&info).await?;

        let capability = match dispense::<C>(connection.as_ref(), &self.name, &info.key) {
            Ok(capability) => capability,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        Ok(PluginInstance::new(info, capability, connection))
    }

    /// Start a plugin; the caller holds the key's lock
    pub(crate) async fn start_locked(
        &self,
        info: PluginInfo,
    ) -> PluginResult<Arc<PluginInstance<C>>> {
        if self.is_closing() {
            return Err(PluginError::ShuttingDown);
        }
        if self.registry.contains(&info.key) {
            return Err(PluginError::AlreadyRunning(info.key));
        }

        let instance = self.launch(info).await?;
        if let Err(e) = self.registry.insert_new(Arc::clone(&instance)) {
            instance.stop().await;
            return Err(e);
        }
        instance.start_watcher(self.config.restart.ping_interval, Arc::clone(&self.notifier));

        // Shutdown may have drained the registry while we were launching
        if self.is_closing() {
            self.registry.remove_if(instance.key(), instance.generation());
            instance.stop().await;
            return Err(PluginError::ShuttingDown);
        }

        info!(
            manager = %self.name,
            plugin = %instance.key(),
            restarts = instance.restarts(),
            "Plugin started"
        );
        Ok(instance)
    }

    /// Stop and unregister exactly this instance
    pub(crate) async fn retire(&self, instance: &Arc<PluginInstance<C>>) {
        self.registry.remove_if(instance.key(), instance.generation());
        instance.stop().await;
    }
}

/// Pull the capability named `name` out of a connection as a `C`
fn dispense<C>(connection: &dyn PluginConnection, name: &str, key: &str) -> PluginResult<C>
where
    C: Clone + Send + Sync + 'static,
{
    connection
        .dispense(name)?
        .downcast::<C>()
        .map(|capability| *capability)
        .map_err(|_| PluginError::InterfaceMismatch {
            key: key.to_string(),
            name: name.to_string(),
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Runs, watches and restarts a set of out-of-process plugins
///
/// `C` is the capability type every plugin dispenses under the manager's
/// `name`. A plugin that hands back anything else fails to load with
/// [`PluginError::InterfaceMismatch`].
///
/// # Example
///
/// ```rust,ignore
/// let connector = ProcessConnector::new(HandshakeConfig::default())
///     .with_plugin("kv", |client| Box::new(client) as RawCapability);
/// let manager: PluginManager<RpcClient> =
///     PluginManager::new("kv", Arc::new(connector), ManagerConfig::default());
///
/// manager.start_plugin(PluginInfo::new("redis", "/opt/plugins/kv-redis")).await?;
/// let kv = manager.get_plugin("redis")?;
/// kv.call("get", json!({"key": "a"})).await?;
///
/// manager.shutdown().await?;
/// ```
pub struct PluginManager<C> {
    pub(crate) inner: Arc<ManagerInner<C>>,
    supervisor: Mutex<Option<SupervisorHandle>>,
    pub(crate) supervisor_state: Option<Arc<supervisor::StateCell>>,
}

impl<C> PluginManager<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Create a manager dispensing capabilities registered under `name`
    ///
    /// With `config.restart.managed` set this spawns the supervisor task, so
    /// it must be called from inside a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ManagerConfig,
    ) -> Self {
        let config = config.normalized();
        let (notifier, supervisor_rx) =
            CrashNotifier::new(config.notify_buffer, config.restart.managed);

        let inner = Arc::new(ManagerInner {
            name: name.into(),
            config,
            connector,
            registry: PluginRegistry::new(),
            notifier: Arc::new(notifier),
            key_locks: KeyLocks::default(),
            closing: AtomicBool::new(false),
        });

        let supervisor = supervisor_rx.map(|rx| supervisor::spawn(Arc::downgrade(&inner), rx));
        let supervisor_state = supervisor.as_ref().map(SupervisorHandle::state_cell);

        debug!(
            manager = %inner.name,
            managed = inner.config.restart.managed,
            "Plugin manager created"
        );

        Self {
            inner,
            supervisor: Mutex::new(supervisor),
            supervisor_state,
        }
    }

    /// Name capabilities are dispensed under
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Whether crashed plugins are restarted automatically
    pub fn is_supervised(&self) -> bool {
        self.inner.config.restart.managed
    }

    /// State of the supervisor task, `None` when unmanaged
    pub fn supervisor_state(&self) -> Option<SupervisorState> {
        self.supervisor_state.as_ref().map(|cell| cell.get())
    }

    /// Start every plugin in order, stopping at the first failure
    ///
    /// Plugins started before the failure stay registered.
    pub async fn load_plugins<I>(&self, infos: I) -> PluginResult<()>
    where
        I: IntoIterator<Item = PluginInfo>,
    {
        for info in infos {
            self.start_plugin(info).await?;
        }
        Ok(())
    }

    /// Start every plugin, or none of them
    ///
    /// On the first failure every plugin this call started is stopped and
    /// unregistered before the error is returned.
    pub async fn load_plugins_atomic<I>(&self, infos: I) -> PluginResult<()>
    where
        I: IntoIterator<Item = PluginInfo>,
    {
        let mut started = Vec::new();
        for info in infos {
            match self.start_plugin(info).await {
                Ok(instance) => started.push(instance),
                Err(e) => {
                    warn!(
                        manager = %self.inner.name,
                        error = %e,
                        rollback = started.len(),
                        "Load failed, rolling back"
                    );
                    for instance in started {
                        let _guard = self.inner.lock_key(instance.key()).await;
                        self.inner.retire(&instance).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Launch a plugin and register it under `info.key`
    pub async fn start_plugin(&self, info: PluginInfo) -> PluginResult<Arc<PluginInstance<C>>> {
        let _guard = self.inner.lock_key(&info.key).await;
        self.inner.start_locked(info).await
    }

    /// Stop a plugin and unregister it
    pub async fn stop_plugin(&self, key: &str) -> PluginResult<()> {
        let _guard = self.inner.lock_key(key).await;
        let instance = self
            .inner
            .registry
            .get(key)
            .ok_or_else(|| PluginError::NotFound(key.to_string()))?;

        self.inner.retire(&instance).await;
        Ok(())
    }

    /// Replace a running plugin with a fresh process
    ///
    /// The new instance carries the old instance's restart count plus one.
    pub async fn restart_plugin(&self, info: PluginInfo) -> PluginResult<Arc<PluginInstance<C>>> {
        let _guard = self.inner.lock_key(&info.key).await;
        let old = self
            .inner
            .registry
            .get(&info.key)
            .ok_or_else(|| PluginError::NotFound(info.key.clone()))?;

        let restarts = old.restarts() + 1;
        self.inner.retire(&old).await;

        info!(manager = %self.inner.name, plugin = %info.key, restarts, "Restarting plugin");
        self.inner.start_locked(info.with_restarts(restarts)).await
    }

    /// Capability of a running plugin
    pub fn get_plugin(&self, key: &str) -> PluginResult<C> {
        self.inner
            .registry
            .get(key)
            .map(|instance| instance.capability().clone())
            .ok_or_else(|| PluginError::NotFound(key.to_string()))
    }

    /// Running instance registered under `key`
    pub fn instance(&self, key: &str) -> Option<Arc<PluginInstance<C>>> {
        self.inner.registry.get(key)
    }

    /// Metadata of every running plugin, ordered by key
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.inner.registry.list()
    }

    /// Receive a copy of every crash notification
    pub fn plugin_killed(&self) -> broadcast::Receiver<CrashNotification> {
        self.inner.notifier.subscribe()
    }

    /// Stop every plugin and the supervisor
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) -> PluginResult<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            debug!(manager = %self.inner.name, "Shutdown already in progress");
            return Ok(());
        }

        let instances = self.inner.registry.drain();
        info!(
            manager = %self.inner.name,
            plugins = instances.len(),
            "Shutting down plugin manager"
        );
        join_all(instances.iter().map(|instance| instance.stop())).await;

        self.inner.notifier.close();

        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }

        info!(manager = %self.inner.name, "Plugin manager stopped");
        Ok(())
    }
}

impl<C> Drop for PluginManager<C> {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().as_ref() {
            supervisor.signal_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::config::RestartConfig;
    use crate::test_support::{FakeConnector, GREETER, GreeterCap, wait_for};

    fn info(key: &str) -> PluginInfo {
        PluginInfo::new(key, format!("/opt/plugins/{key}"))
    }

    fn unmanaged(connector: &FakeConnector) -> PluginManager<GreeterCap> {
        let restart = RestartConfig::default().with_ping_interval(Duration::from_millis(10));
        PluginManager::new(GREETER, Arc::new(connector.clone()), ManagerConfig::new(restart))
    }

    fn managed(connector: &FakeConnector) -> PluginManager<GreeterCap> {
        let restart = RestartConfig::managed()
            .with_ping_interval(Duration::from_millis(10))
            .with_max_restarts(2);
        PluginManager::new(GREETER, Arc::new(connector.clone()), ManagerConfig::new(restart))
    }

    #[tokio::test]
    async fn test_key_lock_slot_removed_after_release() {
        let locks = KeyLocks::default();

        drop(locks.lock("a").await);
        assert_eq!(locks.len(), 0);

        let held = locks.lock("a").await;
        let mut waiting = Box::pin(locks.lock("a"));
        assert!(futures::poll!(waiting.as_mut()).is_pending());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert_eq!(locks.len(), 1);
        let second = waiting.await;
        assert_eq!(locks.len(), 1);
        drop(second);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_key_lock_waiter_leaves_slot() {
        let locks = KeyLocks::default();

        let held = locks.lock("a").await;
        let mut waiting = Box::pin(locks.lock("a"));
        assert!(futures::poll!(waiting.as_mut()).is_pending());
        drop(waiting);
        assert_eq!(locks.len(), 1);

        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_start_get_stop() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);

        let instance = assert_ok!(manager.start_plugin(info("db")).await);
        assert!(instance.is_running());
        assert_eq!(manager.get_plugin("db").unwrap().greet(), "hello from db");
        assert_eq!(manager.list_plugins(), vec![info("db")]);

        assert_ok!(manager.stop_plugin("db").await);
        assert!(matches!(manager.get_plugin("db"), Err(PluginError::NotFound(_))));
        assert!(manager.list_plugins().is_empty());
        assert!(connector.latest("db").unwrap().is_closed());
        assert_eq!(manager.inner.key_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_key_locks_do_not_accumulate() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);

        for n in 0..16 {
            let key = format!("p{n}");
            manager.start_plugin(info(&key)).await.unwrap();
            manager.restart_plugin(info(&key)).await.unwrap();
            manager.stop_plugin(&key).await.unwrap();
        }
        assert!(manager.stop_plugin("missing").await.is_err());

        assert!(manager.list_plugins().is_empty());
        assert_eq!(manager.inner.key_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_start_running_key_fails_without_launching() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);

        manager.start_plugin(info("a")).await.unwrap();
        let err = assert_err!(manager.start_plugin(info("a")).await);

        assert!(matches!(err, PluginError::AlreadyRunning(ref k) if k == "a"));
        assert_eq!(connector.connect_count("a"), 1);
        assert_eq!(manager.list_plugins().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_keep_one_instance() {
        let connector = FakeConnector::new().with_connect_delay(Duration::from_millis(10));
        let manager = unmanaged(&connector);
        let manager = &manager;

        let results = join_all((0..4).map(move |_| manager.start_plugin(info("a")))).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(manager.list_plugins().len(), 1);
        assert_eq!(connector.live_count("a"), 1);
    }

    #[tokio::test]
    async fn test_stop_missing_is_not_found() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);

        let result = tokio::time::timeout(Duration::from_secs(1), manager.stop_plugin("missing"))
            .await
            .expect("stop_plugin blocked");
        assert!(matches!(result, Err(PluginError::NotFound(ref k)) if k == "missing"));
    }

    #[tokio::test]
    async fn test_restart_increments_restarts() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);

        manager.start_plugin(info("a").with_restarts(3)).await.unwrap();
        let first = connector.latest("a").unwrap();

        let instance = manager.restart_plugin(info("a")).await.unwrap();
        assert_eq!(instance.restarts(), 4);
        assert_eq!(manager.list_plugins()[0].restarts, 4);
        assert!(first.is_closed());
        assert_eq!(connector.live_count("a"), 1);
    }

    #[tokio::test]
    async fn test_restart_missing_is_not_found() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);

        let err = manager.restart_plugin(info("a")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(connector.connect_count("a"), 0);
    }

    #[tokio::test]
    async fn test_readers_during_restart() {
        let connector = FakeConnector::new().with_connect_delay(Duration::from_millis(20));
        let manager = unmanaged(&connector);
        let manager = &manager;
        manager.start_plugin(info("a")).await.unwrap();

        let readers = join_all((0..8).map(move |_| async move {
            let mut seen = Vec::new();
            for _ in 0..20 {
                seen.push(manager.get_plugin("a").map(|greeter| greeter.greet()));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            seen
        }));

        let (restarted, seen) = tokio::join!(manager.restart_plugin(info("a")), readers);
        assert_eq!(restarted.unwrap().restarts(), 1);

        for outcome in seen.into_iter().flatten() {
            match outcome {
                Ok(greeting) => assert_eq!(greeting, "hello from a"),
                Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_load_plugins_keeps_earlier_successes() {
        let connector = FakeConnector::new();
        connector.fail("b");
        let manager = unmanaged(&connector);

        let err = manager
            .load_plugins(vec![info("a"), info("b"), info("c")])
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Connection(_)));
        let keys: Vec<String> = manager.list_plugins().into_iter().map(|i| i.key).collect();
        assert_eq!(keys, vec!["a"]);
        assert_eq!(connector.connect_count("c"), 0);
    }

    #[tokio::test]
    async fn test_load_plugins_atomic_rolls_back() {
        let connector = FakeConnector::new();
        connector.fail("c");
        let manager = unmanaged(&connector);

        let result = manager
            .load_plugins_atomic(vec![info("a"), info("b"), info("c")])
            .await;

        assert!(result.is_err());
        assert!(manager.list_plugins().is_empty());
        assert!(connector.latest("a").unwrap().is_closed());
        assert!(connector.latest("b").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_wrong_capability_type() {
        let connector = FakeConnector::new();
        let manager: PluginManager<String> =
            PluginManager::new(GREETER, Arc::new(connector.clone()), ManagerConfig::default());

        let err = manager.start_plugin(info("a")).await.unwrap_err();
        assert!(matches!(err, PluginError::InterfaceMismatch { ref key, .. } if key == "a"));
        assert!(manager.list_plugins().is_empty());
        assert!(connector.latest("a").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_unknown_capability_name() {
        let connector = FakeConnector::new();
        let manager: PluginManager<GreeterCap> =
            PluginManager::new("storage", Arc::new(connector.clone()), ManagerConfig::default());

        let err = manager.start_plugin(info("a")).await.unwrap_err();
        assert!(matches!(err, PluginError::Dispense { .. }));
        assert!(connector.latest("a").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_unmanaged_crash_is_only_observed() {
        let connector = FakeConnector::new();
        let manager = unmanaged(&connector);
        let mut killed = manager.plugin_killed();
        assert!(!manager.is_supervised());
        assert!(manager.supervisor_state().is_none());

        manager.start_plugin(info("db")).await.unwrap();
        connector.crash("db");

        let notification = tokio::time::timeout(Duration::from_secs(2), killed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.key, "db");

        // Nobody restarts it; the dead instance stays registered
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connector.connect_count("db"), 1);
        assert_eq!(manager.list_plugins().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let connector = FakeConnector::new();
        let manager = managed(&connector);
        manager.load_plugins(vec![info("a"), info("b")]).await.unwrap();

        assert_ok!(manager.shutdown().await);
        assert_ok!(manager.shutdown().await);

        assert!(manager.list_plugins().is_empty());
        assert!(connector.latest("a").unwrap().is_closed());
        assert!(connector.latest("b").unwrap().is_closed());
        assert_eq!(manager.supervisor_state(), Some(SupervisorState::Stopped));

        let err = manager.start_plugin(info("c")).await.unwrap_err();
        assert!(matches!(err, PluginError::ShuttingDown));
        assert_eq!(connector.connect_count("c"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_crash_streams() {
        let connector = FakeConnector::new();
        let manager = managed(&connector);
        let mut killed = manager.plugin_killed();
        manager.start_plugin(info("a")).await.unwrap();

        manager.shutdown().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(1), killed.recv())
            .await
            .expect("crash stream stayed open after shutdown");
        assert!(matches!(ended, Err(broadcast::error::RecvError::Closed)));

        let mut late = manager.plugin_killed();
        let ended = tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("late subscription stayed open");
        assert!(matches!(ended, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_during_start() {
        let connector = FakeConnector::new().with_connect_delay(Duration::from_millis(30));
        let manager = managed(&connector);

        let (started, shut) = tokio::join!(manager.start_plugin(info("late")), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            manager.shutdown().await
        });

        shut.unwrap();
        assert!(matches!(started, Err(PluginError::ShuttingDown)));
        assert!(manager.list_plugins().is_empty());
        assert!(wait_for(Duration::from_secs(1), || connector.live_count("late") == 0).await);
    }
}
