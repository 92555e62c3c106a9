//! Observability tracking of in-flight transfer workers

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared registry of the transfer workers currently alive.
///
/// Workers register themselves on spawn and remove themselves when they
/// finish; the collection exists purely for observability and carries no
/// pooling or scheduling role.
#[derive(Debug, Clone, Default)]
pub struct WorkerTracker {
    ids: Arc<Mutex<HashSet<u64>>>,
    next_id: Arc<AtomicU64>,
}

impl WorkerTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new worker; the returned guard deregisters it on drop
    pub fn register(&self) -> WorkerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ids
            .lock()
            .expect("worker tracker lock poisoned")
            .insert(id);
        WorkerGuard {
            id,
            ids: Arc::clone(&self.ids),
        }
    }

    /// Number of workers currently alive
    pub fn active(&self) -> usize {
        self.ids.lock().expect("worker tracker lock poisoned").len()
    }
}

/// Removes its worker from the tracker when dropped
#[derive(Debug)]
pub struct WorkerGuard {
    id: u64,
    ids: Arc<Mutex<HashSet<u64>>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .expect("worker tracker lock poisoned")
            .remove(&self.id);
    }
}
