//! Per-resource single-flight locks.
//!
//! At most one reconciliation pass runs for a given resource key at a time.
//! The guard is held for one pass only; nothing survives across passes, so a
//! cancelled pass simply drops its guard and the next trigger starts fresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Build the lock key for a namespaced resource
pub fn resource_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

/// Map of async mutexes keyed by resource identity
///
/// Entries are held weakly so keys of deleted resources do not accumulate;
/// dead entries are pruned whenever a new key is inserted.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Guard returned by [`KeyedLocks::acquire`]; the key is released on drop
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait until no other pass holds `key`, then hold it
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = self.slot(key);
        KeyGuard {
            key: key.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Hold `key` if it is free right now
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let lock = self.slot(key);
        lock.try_lock_owned().ok().map(|guard| KeyGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of keys currently tracked (live entries only)
    pub fn tracked_keys(&self) -> usize {
        let locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.values().filter(|w| w.strong_count() > 0).count()
    }
}
