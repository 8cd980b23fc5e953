//! In-process execution engine.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::feedback;
use crate::module::{Callable, CompiledModule};
use crate::types::{EngineSnapshot, ExecutionConfig, OutputSpec, Record, STEP_FIELD};

use super::StepEngine;

/// Holds iteration state for one module, output spec, config and input.
///
/// `step` never fails: faults are recorded in the snapshot's `error` while the
/// previous outputs, input and step count are retained.
pub struct Engine {
    module: Arc<CompiledModule>,
    output_spec: OutputSpec,
    config: ExecutionConfig,
    step_count: u64,
    input: Record,
    outputs: Option<Record>,
    error: Option<String>,
}

impl Engine {
    pub fn new(
        module: Arc<CompiledModule>,
        output_spec: OutputSpec,
        config: ExecutionConfig,
        initial_input: Record,
    ) -> Self {
        Self {
            module,
            output_spec,
            config,
            step_count: 0,
            input: initial_input,
            outputs: None,
            error: None,
        }
    }

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn output_spec(&self) -> &OutputSpec {
        &self.output_spec
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            step_count: self.step_count,
            input: self.input.clone(),
            outputs: self.outputs.clone(),
            error: self.error.clone(),
        }
    }

    /// Replace the current input. Clears outputs and error; keeps the step count.
    pub fn set_input(&mut self, input: Record) {
        self.input = input;
        self.outputs = None;
        self.error = None;
    }

    pub fn set_config(&mut self, config: ExecutionConfig) {
        self.config = config;
    }

    /// Execute every declared output once and advance.
    pub fn step(&mut self) -> EngineSnapshot {
        let next_index = self.step_count + 1;

        let mut effective_input = self.input.clone();
        effective_input.insert(STEP_FIELD.to_string(), Value::from(next_index));

        match self.execute(&effective_input) {
            Ok(mut outputs) => {
                outputs.insert(STEP_FIELD.to_string(), Value::from(next_index));

                let mappings = self.config.feedback_mappings();
                let next_input = if mappings.is_empty() {
                    effective_input
                } else {
                    feedback::apply(mappings, &outputs, &effective_input)
                };

                self.input = next_input;
                self.outputs = Some(outputs);
                self.step_count = next_index;
                self.error = None;
                tracing::debug!("Step {} completed", next_index);
            }
            Err(e) => {
                tracing::debug!("Step {} failed: {}", next_index, e);
                self.error = Some(e.to_string());
            }
        }

        self.snapshot()
    }

    /// Resolve every output before invoking any of them, so a missing export
    /// fails the step without running the others.
    fn execute(&self, input: &Record) -> Result<Record> {
        let resolved = self
            .output_spec
            .keys()
            .map(|name| {
                self.module
                    .resolve_output(name)
                    .map(|f| (name, f))
                    .ok_or_else(|| Error::OutputNotFound(name.clone()))
            })
            .collect::<Result<Vec<(&String, Callable)>>>()?;

        let mut results = Record::new();
        for (name, f) in resolved {
            let value = match catch_unwind(AssertUnwindSafe(|| f.call(input))) {
                Ok(Ok(value)) => value,
                Ok(Err(cause)) => {
                    return Err(Error::ExecutionFailed {
                        output: name.clone(),
                        cause,
                    });
                }
                Err(panic) => {
                    return Err(Error::ExecutionFailed {
                        output: name.clone(),
                        cause: panic_message(panic.as_ref()),
                    });
                }
            };
            results.insert(name.clone(), value);
        }

        Ok(results)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "output function panicked".to_string()
    }
}

impl StepEngine for Engine {
    fn snapshot(&self) -> EngineSnapshot {
        Engine::snapshot(self)
    }

    fn set_input(&mut self, input: Record) {
        Engine::set_input(self, input)
    }

    fn set_config(&mut self, config: ExecutionConfig) {
        Engine::set_config(self, config)
    }

    fn step(&mut self) -> BoxFuture<'_, EngineSnapshot> {
        futures::future::ready(Engine::step(self)).boxed()
    }
}
