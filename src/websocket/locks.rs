use dashmap::DashMap;
use std::{hash::Hash, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes created on demand, one per key.
///
/// An entry lives only while someone holds or waits on it; the guard removes
/// it on drop, including when the holding task is cancelled.
pub struct KeyedLocks<K: Eq + Hash + Copy> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Copy> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mut guard = KeyedGuard {
            locks: self,
            key,
            held: None,
        };
        let lock = self.locks.entry(key).or_default().clone();
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, key: &K) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct KeyedGuard<'a, K: Eq + Hash + Copy> {
    locks: &'a KeyedLocks<K>,
    key: K,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Copy> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        // The mutex must be unlocked first so its Arc count drops back to the map's.
        drop(self.held.take());
        self.locks.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_is_removed_after_release() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock(1u32).await;
            assert!(!locks.is_empty());
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = locks.lock(7u32).await;
        let waiter = {
            let locks = locks.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(7).await;
                order.lock().unwrap().push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().unwrap().push("first");
        drop(first);
        waiter.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_aborted_holder_releases_entry() {
        let locks = Arc::new(KeyedLocks::new());
        let holder = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(3u32).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!locks.is_empty());

        holder.abort();
        assert!(holder.await.unwrap_err().is_cancelled());
        assert!(locks.is_empty());

        // the key is usable again
        let _guard = locks.lock(3).await;
    }
}
