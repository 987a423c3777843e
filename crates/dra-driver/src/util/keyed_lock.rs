//! Per-key async lock with automatic cleanup of idle entries.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Serializes operations on a per-key basis: concurrent calls on the
/// same key run sequentially, calls on different keys run in parallel.
///
/// Entries hold `Weak` references; once the last guard for a key drops,
/// the entry is removed, so the map never grows with dead keys.
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<DashMap<K, Weak<Mutex<()>>>>,
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = {
            let entry = self.locks.entry(key.clone()).or_insert_with(Weak::new);
            match entry.upgrade() {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(Mutex::new(()));
                    // entry still holds the map shard lock, so this
                    // replacement cannot race another upgrade
                    let mut entry = entry;
                    *entry = Arc::downgrade(&fresh);
                    fresh
                }
            }
        };

        let guard = mutex.clone().lock_owned().await;
        KeyedLockGuard {
            _guard: guard,
            arc: mutex,
            key: key.clone(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn live_keys(&self) -> usize {
        self.locks.len()
    }
}

/// Guard returned by [`KeyedAsyncLock::lock`]. Dropping it releases the
/// key and removes the map entry if no other task is waiting.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    _guard: OwnedMutexGuard<()>,
    arc: Arc<Mutex<()>>,
    key: K,
    locks: Arc<DashMap<K, Weak<Mutex<()>>>>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        // strong_count == 2 here: self.arc plus the guard's own Arc.
        // No other holder or waiter means the entry can go.
        if Arc::strong_count(&self.arc) <= 2 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 2);
        }
    }
}
