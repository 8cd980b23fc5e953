//! Execution engines.
//!
//! # Engines
//!
//! - **`Engine`** - In-process engine. `step` runs synchronously.
//! - **`EngineProxy`** (see [`crate::proxy`]) - Forwards steps to an isolated
//!   worker; `step` completes when the worker answers.
//!
//! Both implement [`StepEngine`], whose `step` always returns a future. The
//! in-process engine hands back an already-completed one, so callers treat
//! both uniformly.

mod local;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::types::{EngineSnapshot, ExecutionConfig, Record};

pub use local::Engine;

/// Engine-facing contract shared by the local engine and the worker proxy.
pub trait StepEngine: Send {
    /// State after the last completed (or failed) step.
    fn snapshot(&self) -> EngineSnapshot;

    /// Replace the current input without stepping.
    fn set_input(&mut self, input: Record);

    /// Replace the execution config without stepping.
    fn set_config(&mut self, config: ExecutionConfig);

    /// Execute one step. Never fails; faults land in the snapshot's `error`.
    fn step(&mut self) -> BoxFuture<'_, EngineSnapshot>;

    /// Release any resources held outside this process or thread.
    fn shutdown(&mut self) {}
}

impl<E: StepEngine + ?Sized> StepEngine for Box<E> {
    fn snapshot(&self) -> EngineSnapshot {
        (**self).snapshot()
    }

    fn set_input(&mut self, input: Record) {
        (**self).set_input(input)
    }

    fn set_config(&mut self, config: ExecutionConfig) {
        (**self).set_config(config)
    }

    fn step(&mut self) -> BoxFuture<'_, EngineSnapshot> {
        (**self).step()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// One entry of an iteration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStep {
    /// Input the step started from.
    pub input: Record,
    pub outputs: Record,
}

/// Run up to `iterations` steps back to back, collecting the history.
///
/// Stops early at the first failed step; its error stays readable through
/// `engine.snapshot()`.
pub async fn run_iterations<E>(engine: &mut E, iterations: u64) -> Vec<IterationStep>
where
    E: StepEngine + ?Sized,
{
    let mut history = Vec::with_capacity(iterations.min(1024) as usize);

    for _ in 0..iterations {
        let input = engine.snapshot().input;
        let snapshot = engine.step().await;
        match (snapshot.error, snapshot.outputs) {
            (None, Some(outputs)) => history.push(IterationStep { input, outputs }),
            (Some(e), _) => {
                tracing::warn!("Iteration {} failed: {}", snapshot.step_count + 1, e);
                break;
            }
            (None, None) => break,
        }
    }

    history
}
