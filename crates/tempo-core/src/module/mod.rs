//! Compiled modules and the process-wide module cache.
//!
//! A compiled module is an opaque table of named callables. Each declared
//! output `x` is served by the export `_x`.
//!
//! # Loading pipeline
//!
//! ```text
//! ModuleCache::load(location)
//!     │
//!     ├── Fetcher       (transfer raw bytes: HTTP, file)
//!     │
//!     └── ModuleLoader  (bytes → callables)
//!             ├── RegistryLoader  manifest resolved against registered Rust functions
//!             └── DylibLoader     native library opened with libloading
//! ```

mod cache;
mod dylib;
mod fetch;
mod registry;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::LoadError;
use crate::types::Record;

pub use cache::ModuleCache;
pub use dylib::{DylibLoader, ExecutionResult, OutputEntryFn};
pub use fetch::{DefaultFetcher, Fetcher, FileFetcher, HttpFetcher};
pub use registry::{FunctionRegistry, RegistryLoader};

/// A single exported output function.
///
/// Implementations must be pure and safe to call concurrently.
pub trait OutputFn: Send + Sync {
    fn call(&self, input: &Record) -> std::result::Result<Value, String>;
}

impl<F> OutputFn for F
where
    F: Fn(&Record) -> std::result::Result<Value, String> + Send + Sync,
{
    fn call(&self, input: &Record) -> std::result::Result<Value, String> {
        self(input)
    }
}

/// Shared handle to an exported function.
pub type Callable = Arc<dyn OutputFn>;

/// Symbol table of a compiled module.
pub trait ModuleExports: Send + Sync {
    /// Look up an export by its exact name (e.g. `_sum`).
    fn resolve(&self, export: &str) -> Option<Callable>;
}

impl ModuleExports for FxHashMap<String, Callable> {
    fn resolve(&self, export: &str) -> Option<Callable> {
        self.get(export).cloned()
    }
}

/// Turns a fetched payload into a compiled module.
pub trait ModuleLoader: Send + Sync {
    fn evaluate(
        &self,
        location: &str,
        bytes: Vec<u8>,
    ) -> std::result::Result<CompiledModule, LoadError>;
}

/// Export name serving the output `output`.
pub fn export_name(output: &str) -> String {
    format!("_{}", output)
}

/// An immutable, loaded module identified by its source location.
pub struct CompiledModule {
    location: String,
    exports: Box<dyn ModuleExports>,
}

impl CompiledModule {
    pub fn new(location: impl Into<String>, exports: impl ModuleExports + 'static) -> Self {
        Self {
            location: location.into(),
            exports: Box::new(exports),
        }
    }

    /// Build a module from `(export name, function)` pairs.
    pub fn from_exports<I, S>(location: impl Into<String>, exports: I) -> Self
    where
        I: IntoIterator<Item = (S, Callable)>,
        S: Into<String>,
    {
        let table: FxHashMap<String, Callable> = exports
            .into_iter()
            .map(|(name, f)| (name.into(), f))
            .collect();
        Self::new(location, table)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn resolve(&self, export: &str) -> Option<Callable> {
        self.exports.resolve(export)
    }

    /// Callable computing the declared output `output`.
    pub fn resolve_output(&self, output: &str) -> Option<Callable> {
        self.resolve(&export_name(output))
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}
