//! Plugin Registry
//!
//! Key → running instance map shared by the manager and the supervisor.
//! Every operation takes the lock only for the map update itself; callers
//! never hold it across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PluginError, PluginResult};
use crate::info::PluginInfo;
use crate::instance::PluginInstance;

pub(crate) struct PluginRegistry<C> {
    plugins: RwLock<HashMap<String, Arc<PluginInstance<C>>>>,
}

impl<C> PluginRegistry<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<PluginInstance<C>>> {
        self.plugins.read().get(key).cloned()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.plugins.read().contains_key(key)
    }

    /// Register `instance`, returning whatever held its key before
    #[cfg(test)]
    pub(crate) fn insert(
        &self,
        instance: Arc<PluginInstance<C>>,
    ) -> Option<Arc<PluginInstance<C>>> {
        let key = instance.key().to_string();
        self.plugins.write().insert(key, instance)
    }

    /// Register `instance`, failing if its key is taken
    pub(crate) fn insert_new(&self, instance: Arc<PluginInstance<C>>) -> PluginResult<()> {
        let key = instance.key().to_string();
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&key) {
            return Err(PluginError::AlreadyRunning(key));
        }
        plugins.insert(key, instance);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn remove(&self, key: &str) -> Option<Arc<PluginInstance<C>>> {
        self.plugins.write().remove(key)
    }

    /// Remove `key` only while it still maps to instance `generation`
    pub(crate) fn remove_if(&self, key: &str, generation: u64) -> Option<Arc<PluginInstance<C>>> {
        let mut plugins = self.plugins.write();
        match plugins.get(key) {
            Some(current) if current.generation() == generation => plugins.remove(key),
            _ => None,
        }
    }

    /// Snapshot of every registered plugin's metadata, ordered by key
    pub(crate) fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self.plugins.read().values().map(|p| p.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Empty the registry, handing back everything it held
    pub(crate) fn drain(&self) -> Vec<Arc<PluginInstance<C>>> {
        self.plugins.write().drain().map(|(_, p)| p).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.plugins.read().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}
