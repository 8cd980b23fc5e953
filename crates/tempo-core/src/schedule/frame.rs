//! Display-synchronized scheduler.
//!
//! Frame boundaries sit at `epoch + k * frame`. A task becomes due at the
//! first boundary at or after its deadline, so every task whose deadline falls
//! inside the same frame runs on the same boundary, in deadline order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Scheduler, Task, TimerHandle};

/// Default display refresh rate.
pub const DEFAULT_FRAME_RATE: u32 = 60;

struct FrameQueue {
    epoch: Instant,
    frame: Duration,
    pending: Mutex<FxHashMap<u64, (Instant, Task)>>,
    wake: Notify,
}

impl FrameQueue {
    fn pending(&self) -> MutexGuard<'_, FxHashMap<u64, (Instant, Task)>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// First frame boundary at or after `deadline`.
    fn boundary(&self, deadline: Instant) -> Instant {
        let since = deadline.saturating_duration_since(self.epoch);
        let frame = self.frame.as_nanos().max(1);
        let frames = since.as_nanos().div_ceil(frame);
        self.epoch + Duration::from_nanos((frames * frame) as u64)
    }

    fn next_boundary(&self) -> Option<Instant> {
        self.pending()
            .values()
            .map(|(deadline, _)| *deadline)
            .min()
            .map(|deadline| self.boundary(deadline))
    }

    /// Remove and return every task due at `boundary`, in deadline order.
    fn take_due(&self, boundary: Instant) -> Vec<Task> {
        let mut pending = self.pending();
        let mut due: Vec<(Instant, u64)> = pending
            .iter()
            .filter(|(_, (deadline, _))| self.boundary(*deadline) <= boundary)
            .map(|(id, (deadline, _))| (*deadline, *id))
            .collect();
        due.sort_unstable();

        due.into_iter()
            .filter_map(|(_, id)| pending.remove(&id).map(|(_, task)| task))
            .collect()
    }

    async fn drive(self: Arc<Self>) {
        loop {
            let Some(boundary) = self.next_boundary() else {
                self.wake.notified().await;
                continue;
            };

            tokio::select! {
                _ = tokio::time::sleep_until(boundary) => {}
                // An earlier task may have been added; recompute.
                _ = self.wake.notified() => continue,
            }

            let due = self.take_due(boundary);
            if !due.is_empty() {
                tracing::trace!("Frame {:?}: running {} task(s)", boundary - self.epoch, due.len());
            }
            for task in due {
                task.await;
            }
        }
    }
}

/// Runs scheduled tasks on fixed frame boundaries.
pub struct FrameScheduler {
    queue: Arc<FrameQueue>,
    next_id: AtomicU64,
    driver: JoinHandle<()>,
}

impl FrameScheduler {
    /// Scheduler with the given frame length, driven on the current runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new(frame: Duration) -> Self {
        let queue = Arc::new(FrameQueue {
            epoch: Instant::now(),
            frame,
            pending: Mutex::new(FxHashMap::default()),
            wake: Notify::new(),
        });
        let driver = tokio::spawn(Arc::clone(&queue).drive());

        Self {
            queue,
            next_id: AtomicU64::new(1),
            driver,
        }
    }

    pub fn with_frame_rate(frames_per_second: u32) -> Self {
        let fps = frames_per_second.max(1);
        Self::new(Duration::from_secs(1) / fps)
    }

    pub fn frame(&self) -> Duration {
        self.queue.frame
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::with_frame_rate(DEFAULT_FRAME_RATE)
    }
}

impl Scheduler for FrameScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        self.queue.pending().insert(id, (deadline, task));
        self.queue.wake.notify_one();
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.queue.pending().remove(&handle.id());
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
