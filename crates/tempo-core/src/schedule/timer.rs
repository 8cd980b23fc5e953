//! Wall-clock one-shot timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::{Scheduler, Task, TimerHandle};

// `None` until the spawned task's abort handle has been recorded.
type PendingMap = FxHashMap<u64, Option<AbortHandle>>;

/// Spawns one sleeping tokio task per scheduled task.
///
/// A task claims its own entry before running; once claimed, `cancel` no
/// longer finds it and cannot interrupt it.
pub struct TimerScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingMap>>,
}

impl TimerScheduler {
    /// Scheduler on the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Number of scheduled tasks that have neither fired nor been cancelled.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).insert(id, None);

        let pending = Arc::clone(&self.pending);
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = lock(&pending).remove(&id).is_some();
            if claimed {
                task.await;
            }
        });

        if let Some(slot) = lock(&self.pending).get_mut(&id) {
            *slot = Some(join.abort_handle());
        }

        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(entry) = lock(&self.pending).remove(&handle.id()) {
            tracing::trace!("Cancelled timer {}", handle.id());
            if let Some(abort) = entry {
                abort.abort();
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.pending).drain() {
            if let Some(abort) = entry {
                abort.abort();
            }
        }
    }
}
