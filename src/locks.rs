//! Named process-local locks
//!
//! Indexers and method handlers serialize on string-named resources such as
//! `index:votes:<db>:<source>` or `members:<community>`. Locks are created on
//! first use and dropped from the map once nobody holds or waits on them.
//! They are not reentrant: taking the same name twice in one task deadlocks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<LockMap>,
}

/// Scoped guard; the lock is released on drop.
pub struct NamedLockGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for and acquire the lock called `name`.
    pub async fn lock(&self, name: &str) -> NamedLockGuard {
        let mutex = self.mutex_for(name);
        let guard = mutex.lock_owned().await;
        trace!(lock = name, "Acquired lock");
        NamedLockGuard {
            name: name.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self, name: &str) -> Option<NamedLockGuard> {
        let mutex = self.mutex_for(name);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(NamedLockGuard {
                name: name.to_string(),
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => None,
        }
    }

    /// Acquire several locks in sorted order.
    pub async fn lock_all(&self, names: &[String]) -> Vec<NamedLockGuard> {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            guards.push(self.lock(name).await);
        }
        guards
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Safe under the shard lock: a waiter would hold a second reference
        self.locks
            .remove_if(&self.name, |_, m| Arc::strong_count(m) == 1);
        trace!(lock = %self.name, "Released lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let locks = LockRegistry::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("members:c1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entries_removed_after_release() {
        let locks = LockRegistry::new();
        {
            let guard = locks.lock("a").await;
            assert_eq!(guard.name(), "a");
            assert!(locks.is_locked("a"));
            assert!(locks.try_lock("a").is_none());
        }
        assert!(!locks.is_locked("a"));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_names_do_not_block() {
        let locks = LockRegistry::new();
        let _a = locks.lock("a").await;
        assert!(locks.try_lock("b").is_some());
    }

    #[tokio::test]
    async fn test_lock_all_dedups() {
        let locks = LockRegistry::new();
        let guards = locks
            .lock_all(&["items:c:2".to_string(), "items:c:1".to_string(), "items:c:2".to_string()])
            .await;
        let names: Vec<&str> = guards.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["items:c:1", "items:c:2"]);
    }
}
