//! In-process mutual exclusion keyed by segment or thread id.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

/// A table of mutexes created on demand, one per key.
///
/// Entries are dropped again once nobody holds or waits on them, so the
/// table only grows with the number of keys in use at the same time.
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: K, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(key).or_default())
        };

        let result = {
            let _guard = slot.lock();
            f()
        };

        let mut table = self.table.lock();
        drop(slot);
        if let Some(entry) = table.get(&key) {
            if Arc::strong_count(entry) == 1 {
                table.remove(&key);
            }
        }

        result
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Copy> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
