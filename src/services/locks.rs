use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::ScreeningId;

/// Per-screening async mutexes.
///
/// Holding the guard for a screening excludes every other holder for the same
/// screening while leaving other screenings untouched. Waiters are served in
/// FIFO order. Idle entries are pruned on acquisition.
#[derive(Clone, Default)]
pub struct ScreeningLocks {
    inner: Arc<Mutex<HashMap<ScreeningId, Arc<AsyncMutex<()>>>>>,
}

pub type ScreeningGuard = OwnedMutexGuard<()>;

impl ScreeningLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, screening_id: ScreeningId) -> ScreeningGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(screening_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of screenings with a held or awaited lock.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|lock| Arc::strong_count(lock) > 1).count()
    }
}
