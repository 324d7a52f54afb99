//! Reference-counted per-path read/write locks.
//!
//! The [`LockRegistry`] hands out one [`tokio::sync::RwLock`] per path that is
//! currently in flight. Entries are created on first acquire and removed as
//! soon as the last holder (or waiter) releases them, so memory is bounded by
//! the number of paths in use rather than the number of paths ever touched.
//!
//! # Locking Strategy
//!
//! - **Single path**: shared guards for readers, exclusive guards for writers
//! - **Multiple paths**: always acquired in lexicographic order of the key via
//!   [`LockRegistry::write_ordered`] / [`LockRegistry::lock_ordered`]
//!
//! No other code in the crate may lock two paths in a different order.
//!
//! # Refcount Protocol
//!
//! Acquire: under the registry mutex, load-or-insert the entry and increment
//! its refcount; then await the per-path lock outside the mutex.
//! Release: drop the per-path guard, then decrement under the registry mutex
//! and remove the entry when the count reaches zero.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

#[derive(Debug)]
struct LockEntry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// Registry of per-path locks.
///
/// Shared via `Arc`; guards keep a reference back to the registry so they can
/// release their entry on drop.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, LockEntry>>,
}

/// Access mode for [`LockRegistry::lock_ordered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the refcount for `key`, creating the entry if needed.
    ///
    /// The returned lease undoes exactly this increment when dropped, which
    /// also covers futures cancelled while waiting on the lock.
    fn checkout(self: &Arc<Self>, key: &str) -> (Arc<RwLock<()>>, Lease) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| LockEntry {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        entry.refs += 1;
        let lock = Arc::clone(&entry.lock);
        drop(entries);

        (
            lock,
            Lease {
                registry: Arc::clone(self),
                key: key.to_string(),
            },
        )
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(key);
                trace!(key, "Lock entry removed");
            }
        }
    }

    /// Acquire a shared lock on `key`.
    pub async fn read(self: &Arc<Self>, key: &str) -> PathReadGuard {
        let (lock, lease) = self.checkout(key);
        let guard = lock.read_owned().await;
        PathReadGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Acquire an exclusive lock on `key`.
    pub async fn write(self: &Arc<Self>, key: &str) -> PathWriteGuard {
        let (lock, lease) = self.checkout(key);
        let guard = lock.write_owned().await;
        PathWriteGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Acquire exclusive locks on several keys in lexicographic order.
    ///
    /// Duplicate keys are locked once. Guards are returned in sorted order.
    pub async fn write_ordered(self: &Arc<Self>, keys: &[&str]) -> Vec<(String, PathWriteGuard)> {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            let guard = self.write(key).await;
            guards.push((key.to_string(), guard));
        }
        guards
    }

    /// Acquire locks with per-key modes in lexicographic order of the keys.
    ///
    /// When the same key appears more than once, the strongest requested mode
    /// wins and it is locked once.
    pub async fn lock_ordered(self: &Arc<Self>, requests: &[(&str, LockMode)]) -> Vec<PathGuard> {
        let mut sorted: Vec<(&str, LockMode)> = requests.to_vec();
        sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut merged: Vec<(&str, LockMode)> = Vec::with_capacity(sorted.len());
        for (key, mode) in sorted {
            match merged.last_mut() {
                Some((last, last_mode)) if *last == key => {
                    if mode == LockMode::Exclusive {
                        *last_mode = LockMode::Exclusive;
                    }
                }
                _ => merged.push((key, mode)),
            }
        }

        let mut guards = Vec::with_capacity(merged.len());
        for (key, mode) in merged {
            let guard = match mode {
                LockMode::Shared => PathGuard::Shared(self.read(key).await),
                LockMode::Exclusive => PathGuard::Exclusive(self.write(key).await),
            };
            guards.push(guard);
        }
        guards
    }

    /// Number of paths that currently hold or await a lock.
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Current refcount for `key` (0 if absent).
    pub fn ref_count(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refs)
    }
}

/// Holds one refcount on a registry entry.
#[derive(Debug)]
struct Lease {
    registry: Arc<LockRegistry>,
    key: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

// Field order matters in the guards below: fields drop in declaration order,
// so the per-path lock is released before the refcount is decremented.

/// Shared access to one path.
#[derive(Debug)]
pub struct PathReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
    _lease: Lease,
}

/// Exclusive access to one path.
#[derive(Debug)]
pub struct PathWriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    _lease: Lease,
}

/// Either kind of guard, as returned by [`LockRegistry::lock_ordered`].
#[derive(Debug)]
pub enum PathGuard {
    Shared(PathReadGuard),
    Exclusive(PathWriteGuard),
}
