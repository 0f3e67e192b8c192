//! Per-identifier serialization primitives

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on demand and dropped when unused
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();

        let guard = mutex.clone().lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub(crate) struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // map + this guard; anything more is a waiter
        if Arc::strong_count(&self.mutex) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Identifiers whose operation is currently executing
#[derive(Debug, Clone, Default)]
pub(crate) struct InflightSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InflightSet {
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Identifiers in flight right now, in no particular order
    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Mark `id` in flight until the returned guard drops
    pub(crate) fn insert(&self, id: &str) -> InflightGuard {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        InflightGuard {
            set: self.clone(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct InflightGuard {
    set: InflightSet,
    id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
