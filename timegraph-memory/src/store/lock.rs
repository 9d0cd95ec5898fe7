//! Per-group mutual exclusion

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per group id, created on first use.
///
/// Writers of different groups never contend; writers of the same group
/// queue in FIFO order.
#[derive(Debug, Default)]
pub struct GroupLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, group_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
