//! Per-identity lock manager.
//!
//! Ingestion and tagging serialize all mutations touching the same adapter
//! identity. `IdentityLocks` hands out mutual exclusion on a *set* of
//! identity keys: a caller blocks until every key in its set is free and
//! then takes all of them in one step under the registry mutex, so two
//! callers can never each hold one of two keys the other wants.
//!
//! Lock entries are created lazily and reference counted; an entry is
//! dropped from the registry as soon as nobody holds or waits on it.

use crate::entity::QuickId;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Registry {
    /// Keys currently held, with the number of guards + waiters referencing
    /// each. A key present with `held == false` only exists while waiters
    /// remain registered on it.
    entries: HashMap<QuickId, Entry>,
}

#[derive(Default)]
struct Entry {
    held: bool,
    refs: usize,
}

/// Lazily-constructed mutual-exclusion map keyed by identity.
#[derive(Default)]
pub struct IdentityLocks {
    inner: Arc<LocksInner>,
}

#[derive(Default)]
struct LocksInner {
    registry: Mutex<Registry>,
    released: Condvar,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire mutual exclusion on the union of the given keys, blocking
    /// until all are simultaneously free.
    pub fn acquire(&self, keys: &[QuickId]) -> IdentityGuard {
        self.acquire_with_deadline(keys, None)
            .expect("acquire without deadline cannot time out")
    }

    /// Like [`acquire`](Self::acquire), with an optional deadline. Returns
    /// `None` when the deadline elapses before all keys are free.
    pub fn acquire_with_deadline(
        &self,
        keys: &[QuickId],
        deadline: Option<Duration>,
    ) -> Option<IdentityGuard> {
        let mut keys: Vec<QuickId> = keys.to_vec();
        keys.sort();
        keys.dedup();

        let started = Instant::now();
        let mut registry = self.inner.registry.lock().expect("lock registry poisoned");

        // Register interest so entries survive while we wait.
        for key in &keys {
            registry.entries.entry(key.clone()).or_default().refs += 1;
        }

        loop {
            let all_free = keys
                .iter()
                .all(|k| !registry.entries.get(k).map(|e| e.held).unwrap_or(false));
            if all_free {
                for key in &keys {
                    registry
                        .entries
                        .get_mut(key)
                        .expect("entry registered above")
                        .held = true;
                }
                return Some(IdentityGuard {
                    inner: Arc::clone(&self.inner),
                    keys,
                });
            }

            registry = match deadline {
                None => self
                    .inner
                    .released
                    .wait(registry)
                    .expect("lock registry poisoned"),
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        Self::unregister(&mut registry, &keys, false);
                        return None;
                    }
                    let (guard, _timeout) = self
                        .inner
                        .released
                        .wait_timeout(registry, limit - elapsed)
                        .expect("lock registry poisoned");
                    guard
                }
            };
        }
    }

    /// Number of live entries; exposed for tests of garbage collection.
    pub fn entry_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .expect("lock registry poisoned")
            .entries
            .len()
    }

    fn unregister(registry: &mut Registry, keys: &[QuickId], release_held: bool) {
        for key in keys {
            if let Some(entry) = registry.entries.get_mut(key) {
                if release_held {
                    entry.held = false;
                }
                entry.refs -= 1;
                if entry.refs == 0 {
                    registry.entries.remove(key);
                }
            }
        }
    }
}

/// Scope guard releasing all keys of an acquisition on drop.
pub struct IdentityGuard {
    inner: Arc<LocksInner>,
    keys: Vec<QuickId>,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        let mut registry = self.inner.registry.lock().expect("lock registry poisoned");
        IdentityLocks::unregister(&mut registry, &self.keys, true);
        self.inner.released.notify_all();
    }
}
