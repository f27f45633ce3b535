use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-entity async locks. Registry mutation for a branch or a user takes
/// that entity's lock, so mutations on different entities never contend.
///
/// The table grows freely up to `cleanup_threshold`; once it reaches the
/// threshold, entries nobody currently holds are swept in one pass. Sweeping
/// drops usage well below the threshold, so the table does not thrash
/// between grow and shrink on every acquisition.
pub struct ShardedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
    cleanup_threshold: usize,
}

impl<K> ShardedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(cleanup_threshold: usize) -> Self {
        Self {
            locks: DashMap::new(),
            cleanup_threshold,
        }
    }

    /// Acquires the lock for one entity, creating it on first use.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        self.maybe_sweep();
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Acquires locks for several entities in sorted order, so two callers
    /// locking overlapping sets cannot deadlock.
    pub async fn acquire_many(&self, mut keys: Vec<K>) -> Vec<OwnedMutexGuard<()>>
    where
        K: Ord,
    {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.acquire(key).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    fn maybe_sweep(&self) {
        if self.locks.len() < self.cleanup_threshold {
            return;
        }
        // strong_count == 1 means only the table itself references the lock:
        // nobody holds or awaits it.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = ShardedLocks::new(64);
        let _a = locks.acquire(1i64).await;
        // Must complete immediately even while key 1 stays held.
        let _b = locks.acquire(2i64).await;
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(ShardedLocks::new(64));
        let guard = locks.acquire(1i64).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(1i64).await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.expect("contender completes after release");
    }

    #[tokio::test]
    async fn sweeps_idle_entries_at_threshold() {
        let locks = ShardedLocks::new(8);
        for key in 0i64..8 {
            let _g = locks.acquire(key).await;
        }
        assert_eq!(locks.len(), 8);

        // Crossing the threshold triggers a sweep; all 8 are idle.
        let _held = locks.acquire(100i64).await;
        assert!(locks.len() <= 2);
    }

    #[tokio::test]
    async fn sweep_keeps_held_locks() {
        let locks = ShardedLocks::new(4);
        let held = locks.acquire(0i64).await;
        for key in 1i64..4 {
            let _g = locks.acquire(key).await;
        }
        let _more = locks.acquire(10i64).await;
        drop(held);
        // The held lock must have survived the sweep while it was held.
        let _again = locks.acquire(0i64).await;
    }

    #[tokio::test]
    async fn acquire_many_sorts_and_dedups() {
        let locks = ShardedLocks::new(64);
        let guards = locks.acquire_many(vec![3i64, 1, 3, 2]).await;
        assert_eq!(guards.len(), 3);
    }
}
