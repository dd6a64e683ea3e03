//! Per-resource mutual exclusion.
//!
//! The held set is the only shared mutable state the scheduler and workers
//! contend on. Acquisition is a single check-and-set under the mutex, and the
//! returned guard releases the key when dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::models::LockKey;

#[derive(Clone, Default)]
pub struct ResourceLocks {
    held: Arc<Mutex<HashSet<LockKey>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if another execution holds it.
    pub fn try_acquire(&self, key: &LockKey) -> Option<ResourceGuard> {
        if self.lock().insert(key.clone()) {
            Some(ResourceGuard {
                key: key.clone(),
                held: self.held.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.lock().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<LockKey>> {
        // The set stays consistent even if a holder panicked mid-operation.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of exclusive access to one resource. Released on drop.
#[derive(Debug)]
pub struct ResourceGuard {
    key: LockKey,
    held: Arc<Mutex<HashSet<LockKey>>>,
}

impl ResourceGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
