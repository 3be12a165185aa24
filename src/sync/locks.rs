//! Per-task lock registry.
//!
//! At most one HTTP operation may be in flight per agent task; upload
//! workers and webhook-driven download work serialize through the same
//! lock, keyed by agent id. Not-yet-mapped remote ids get their own keyed
//! lock so duplicate creations cannot race.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct TaskLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a key, waiting if another operation holds it.
    /// The guard is owned so it can cross await points inside a worker.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().await;
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Acquire for an agent task.
    pub async fn acquire_agent(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        self.acquire(&format!("agent:{agent_id}")).await
    }

    /// Acquire for a not-yet-mapped remote id (creation guard).
    pub async fn acquire_remote(&self, remote_id: &str) -> OwnedMutexGuard<()> {
        self.acquire(&format!("remote:{remote_id}")).await
    }

    /// Drop registry entries nobody holds. Called opportunistically by the
    /// housekeeper; the map otherwise grows with every task ever touched.
    pub async fn prune(&self) -> usize {
        let mut table = self.inner.lock().await;
        let before = table.len();
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - table.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_same_key() {
        let locks = TaskLocks::new();
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire_agent("t1").await;
                let value = counter.fetch_add(1, Ordering::SeqCst);
                // If two tasks were inside simultaneously, both would read
                // the same pre-increment value and the final count would
                // disagree with the number of entries.
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                assert_eq!(counter.load(Ordering::SeqCst), value + 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = TaskLocks::new();
        let _a = locks.acquire_agent("t1").await;
        // Would deadlock if agent and remote keys collided.
        let _b = locks.acquire_remote("t1").await;
        let _c = locks.acquire_agent("t2").await;
    }

    #[tokio::test]
    async fn prune_drops_unheld_entries() {
        let locks = TaskLocks::new();
        {
            let _guard = locks.acquire_agent("t1").await;
            assert_eq!(locks.len().await, 1);
            // Held entries survive pruning.
            assert_eq!(locks.prune().await, 0);
        }
        assert_eq!(locks.prune().await, 1);
        assert_eq!(locks.len().await, 0);
    }
}
