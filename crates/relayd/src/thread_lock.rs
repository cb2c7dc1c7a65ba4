use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One single-permit gate per thread id. Runs on different threads never wait
/// on each other.
#[derive(Clone, Default)]
pub struct ThreadLocks {
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    closed: Arc<AtomicBool>,
}

/// Held for the duration of a run; dropping it (including by cancellation)
/// opens the gate for the next run on the same thread.
pub struct ThreadGuard {
    _permit: OwnedSemaphorePermit,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` once the locks have been closed.
    pub async fn acquire(&self, thread_id: &str) -> Option<ThreadGuard> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let semaphore = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            // Idle gates are referenced only by the map.
            gates.retain(|id, gate| id == thread_id || Arc::strong_count(gate) > 1);
            gates
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let permit = semaphore.acquire_owned().await.ok()?;
        Some(ThreadGuard { _permit: permit })
    }

    /// Fails every pending and future acquisition.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        for gate in gates.values() {
            gate.close();
        }
    }

    pub fn is_held(&self, thread_id: &str) -> bool {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .get(thread_id)
            .map(|gate| gate.available_permits() == 0)
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
