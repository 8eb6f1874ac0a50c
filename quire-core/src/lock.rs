//! Keyed async mutex table.
//!
//! One `tokio::sync::Mutex` per normalized path, created on first use and
//! removed when the last holder or waiter lets go. Tokio mutexes queue
//! waiters FIFO, which gives same-path operations their ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::path::normalize_path;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct PathLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`. Never times out.
    pub async fn acquire(&self, path: &str) -> PathGuard {
        let key = normalize_path(path);
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        PathGuard {
            key,
            slot: Some(slot),
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of paths with a holder or waiter.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every slot. Outstanding guards still release their own mutex.
    pub fn release_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if !slots.is_empty() {
            log::debug!("releasing {} path locks", slots.len());
        }
        slots.clear();
    }
}

/// Held lock on one path. Released on drop, including on error paths.
pub struct PathGuard {
    key: String,
    slot: Option<Slot>,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl PathGuard {
    pub fn path(&self) -> &str {
        &self.key
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // Unlock first so the next waiter can proceed.
        drop(self.guard.take());
        let Some(slot) = self.slot.take() else {
            return;
        };

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let is_current = slots
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        // Table entry + our clone: nobody else holds or waits.
        if is_current && Arc::strong_count(&slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
