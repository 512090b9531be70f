//! Per-component mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// One async mutex per component. At most one execution holds a
/// component at a time; distinct components proceed in parallel.
#[derive(Clone, Default)]
pub struct ComponentLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ComponentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, component: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Entries nobody holds or waits on are dropped.
        map.retain(|_, m| Arc::strong_count(m) > 1);
        Arc::clone(map.entry(component.to_string()).or_default())
    }

    /// Wait until `component` is free and hold it until the guard drops.
    pub async fn lock(&self, component: &str) -> OwnedMutexGuard<()> {
        self.entry(component).lock_owned().await
    }

    /// Take `component` only if nobody holds it.
    pub fn try_lock(&self, component: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(component).try_lock_owned().ok()
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }
}
