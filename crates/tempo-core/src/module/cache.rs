//! Memoizing module cache with shared in-flight loads.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;

use crate::error::LoadError;

use super::{CompiledModule, Fetcher, ModuleLoader};

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<CompiledModule>, LoadError>>>;

/// Fetches and memoizes compiled modules by location.
///
/// Concurrent loads of the same location share a single transfer. A failed
/// load is evicted once it settles so the next call retries from scratch.
pub struct ModuleCache {
    fetcher: Arc<dyn Fetcher>,
    loader: Arc<dyn ModuleLoader>,
    entries: Mutex<FxHashMap<String, LoadFuture>>,
}

impl ModuleCache {
    pub fn new(fetcher: Arc<dyn Fetcher>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            fetcher,
            loader,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Load the module at `location`, reusing a cached or in-flight load.
    pub async fn load(&self, location: &str) -> Result<Arc<CompiledModule>, LoadError> {
        if location.is_empty() {
            return Err(LoadError::EmptyLocation);
        }

        let pending = self
            .entries()
            .entry(location.to_string())
            .or_insert_with(|| self.start_load(location))
            .clone();

        let result = pending.clone().await;

        if let Err(e) = &result {
            let mut entries = self.entries();
            if entries.get(location).is_some_and(|f| f.ptr_eq(&pending)) {
                tracing::debug!("Evicting failed load of {}: {}", location, e);
                entries.remove(location);
            }
        }

        result
    }

    /// Evict one location, or every entry when `location` is `None`.
    pub fn invalidate(&self, location: Option<&str>) {
        let mut entries = self.entries();
        match location {
            Some(location) => {
                entries.remove(location);
            }
            None => entries.clear(),
        }
    }

    /// Whether `location` has a cached or in-flight entry.
    pub fn contains(&self, location: &str) -> bool {
        self.entries().contains_key(location)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<String, LoadFuture>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_load(&self, location: &str) -> LoadFuture {
        let fetcher = Arc::clone(&self.fetcher);
        let loader = Arc::clone(&self.loader);
        let location = location.to_string();

        async move {
            tracing::info!("Loading module from {}", location);
            let bytes = fetcher.fetch(&location).await?;
            let module = loader.evaluate(&location, bytes)?;
            tracing::debug!("Module {} loaded", location);
            Ok(Arc::new(module))
        }
        .boxed()
        .shared()
    }
}
