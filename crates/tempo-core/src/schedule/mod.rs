//! One-shot delayed execution.
//!
//! A scheduler runs a task once after a delay and can cancel tasks that have
//! not started yet. Periodic behavior is built by the caller re-arming after
//! each fire, never by the scheduler itself.
//!
//! - `TimerScheduler` - wall-clock timer per task. Deterministic under tokio's
//!   paused test clock.
//! - `FrameScheduler` - coalesces due tasks onto fixed frame boundaries.

mod frame;
mod timer;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub use frame::{DEFAULT_FRAME_RATE, FrameScheduler};
pub use timer::TimerScheduler;

/// Work run by a scheduler when its delay elapses.
pub type Task = BoxFuture<'static, ()>;

/// Identifies one scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Runs tasks once after a delay.
pub trait Scheduler: Send + Sync {
    /// Arrange for `task` to run once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Prevent a task from running. No-op for unknown, fired or already
    /// cancelled handles; a task that has started is not interrupted.
    fn cancel(&self, handle: TimerHandle);
}

/// Which scheduler implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Timer,
    Frame,
}

impl SchedulerKind {
    /// Build the scheduler on the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn build(self, frame_rate: u32) -> Arc<dyn Scheduler> {
        match self {
            Self::Timer => Arc::new(TimerScheduler::new()),
            Self::Frame => Arc::new(FrameScheduler::with_frame_rate(frame_rate)),
        }
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(Self::Timer),
            "frame" => Ok(Self::Frame),
            other => Err(format!("unknown scheduler '{}' (expected timer or frame)", other)),
        }
    }
}
