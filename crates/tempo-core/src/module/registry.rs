//! Registered-function modules.
//!
//! The payload is a JSON manifest mapping export names to function ids:
//!
//! ```json
//! { "exports": { "_sum": "arith.sum", "_next_state": "life.step" } }
//! ```
//!
//! Each id must have been registered in the [`FunctionRegistry`] the loader
//! was built with.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::LoadError;
use crate::types::Record;

use super::{Callable, CompiledModule, ModuleLoader};

/// Table of Rust functions addressable by id.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, Callable>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `id`, replacing any previous registration.
    pub fn register<F>(&mut self, id: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Record) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(id.into(), Arc::new(f));
        self
    }

    pub fn get(&self, id: &str) -> Option<Callable> {
        self.functions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[derive(Deserialize)]
struct Manifest {
    exports: BTreeMap<String, String>,
}

/// Builds modules from manifests resolved against a [`FunctionRegistry`].
#[derive(Clone)]
pub struct RegistryLoader {
    registry: Arc<FunctionRegistry>,
}

impl RegistryLoader {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }
}

impl ModuleLoader for RegistryLoader {
    fn evaluate(&self, location: &str, bytes: Vec<u8>) -> Result<CompiledModule, LoadError> {
        let eval_error = |message: String| LoadError::Eval {
            location: location.to_string(),
            message,
        };

        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| eval_error(format!("invalid module manifest: {}", e)))?;

        let mut table: FxHashMap<String, Callable> = FxHashMap::default();
        for (export, id) in manifest.exports {
            let f = self
                .registry
                .get(&id)
                .ok_or_else(|| eval_error(format!("export '{}' refers to unknown function '{}'", export, id)))?;
            table.insert(export, f);
        }

        tracing::debug!("Resolved {} exports for {}", table.len(), location);
        Ok(CompiledModule::new(location, table))
    }
}
