//! Core engine for Tempo, an iterative execution and feedback loop runner.
//!
//! This crate provides:
//! - Module cache with shared in-flight loads
//! - Step engine with output-to-input feedback
//! - Timer and frame-synchronized schedulers
//! - Play/pause/step controller with snapshot subscriptions
//! - Worker proxy for out-of-process execution

pub mod compiler;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod ipc;
pub mod module;
pub mod proxy;
pub mod schedule;
pub mod types;
pub mod validate;

#[cfg(test)]
mod test_support;

pub use compiler::CompilerClient;
pub use config::TempoConfig;
pub use controller::{Controller, Subscription};
pub use engine::{Engine, IterationStep, StepEngine, run_iterations};
pub use error::{Error, LoadError, Result};
pub use module::{CompiledModule, ModuleCache};
pub use proxy::EngineProxy;
pub use schedule::{FrameScheduler, Scheduler, SchedulerKind, TimerHandle, TimerScheduler};
pub use types::{
    CompileResult, EngineSnapshot, ExecutionConfig, FeedbackMapping, InputSchema, OutputSpec,
    Record,
};
pub use validate::{InputValidator, SchemaValidator, ValidationErrors};
