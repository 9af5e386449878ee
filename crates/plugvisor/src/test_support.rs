//! In-memory connector used by unit tests
//!
//! Every connection hands out a [`FakeControl`] so tests can kill a plugin,
//! watch it close, and count launches without spawning processes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::{Connector, PluginConnection, RawCapability};
use crate::error::{PluginError, PluginResult};
use crate::info::PluginInfo;

pub(crate) const GREETER: &str = "greeter";

pub(crate) trait Greeter: std::fmt::Debug + Send + Sync {
    fn greet(&self) -> String;
}

pub(crate) type GreeterCap = Arc<dyn Greeter>;

#[derive(Debug)]
struct FakeGreeter {
    key: String,
}

impl Greeter for FakeGreeter {
    fn greet(&self) -> String {
        format!("hello from {}", self.key)
    }
}

/// Test handle on one fake plugin process
#[derive(Default)]
pub(crate) struct FakeControl {
    dead: AtomicBool,
    closes: AtomicUsize,
}

impl FakeControl {
    pub(crate) fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeState {
    launched: HashMap<String, Vec<Arc<FakeControl>>>,
    /// Keys whose connect fails
    failing: HashSet<String>,
    /// Keys whose every launch dies right away
    broken: HashSet<String>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
    connect_delay: Option<Duration>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every connect
    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Kill the most recent launch of `key`
    pub(crate) fn crash(&self, key: &str) {
        if let Some(control) = self.latest(key) {
            control.kill();
        }
    }

    /// Make connects for `key` fail
    pub(crate) fn fail(&self, key: &str) {
        self.state.lock().failing.insert(key.to_string());
    }

    /// Kill the current and every future launch of `key`
    pub(crate) fn break_plugin(&self, key: &str) {
        self.state.lock().broken.insert(key.to_string());
        self.crash(key);
    }

    pub(crate) fn latest(&self, key: &str) -> Option<Arc<FakeControl>> {
        self.state.lock().launched.get(key)?.last().cloned()
    }

    pub(crate) fn connect_count(&self, key: &str) -> usize {
        self.state.lock().launched.get(key).map_or(0, Vec::len)
    }

    /// Launches of `key` that are alive and not closed
    pub(crate) fn live_count(&self, key: &str) -> usize {
        self.state.lock().launched.get(key).map_or(0, |launches| {
            launches
                .iter()
                .filter(|c| !c.is_closed() && !c.dead.load(Ordering::SeqCst))
                .count()
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, info: &PluginInfo) -> PluginResult<Box<dyn PluginConnection>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let control = Arc::new(FakeControl::default());
        {
            let mut state = self.state.lock();
            if state.failing.contains(&info.key) {
                return Err(PluginError::Connection(format!("{} refused to start", info.key)));
            }
            if state.broken.contains(&info.key) {
                control.kill();
            }
            state
                .launched
                .entry(info.key.clone())
                .or_default()
                .push(Arc::clone(&control));
        }

        Ok(Box::new(FakeConnection {
            key: info.key.clone(),
            control,
        }))
    }
}

struct FakeConnection {
    key: String,
    control: Arc<FakeControl>,
}

#[async_trait]
impl PluginConnection for FakeConnection {
    fn dispense(&self, name: &str) -> PluginResult<RawCapability> {
        if name != GREETER {
            return Err(PluginError::Dispense {
                name: name.to_string(),
                reason: format!("{} only serves {}", self.key, GREETER),
            });
        }
        let greeter: GreeterCap = Arc::new(FakeGreeter {
            key: self.key.clone(),
        });
        Ok(Box::new(greeter))
    }

    async fn is_healthy(&self) -> bool {
        !self.control.dead.load(Ordering::SeqCst) && !self.control.is_closed()
    }

    async fn close(&self) {
        self.control.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `check` until it holds or `timeout` passes
pub(crate) async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
