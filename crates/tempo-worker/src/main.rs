//! Tempo worker process.
//!
//! Hosts one engine and answers framed commands from the parent over
//! stdin/stdout. Logs go to stderr only; stdout carries the protocol.

use std::sync::Arc;

use tempo_core::TempoConfig;
use tempo_core::ipc::{WorkerState, serve};
use tempo_core::module::{DefaultFetcher, DylibLoader, ModuleCache};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("TEMPO_WORKER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = TempoConfig::load(None)?;
    let loader = match config.module_dir {
        Some(dir) => DylibLoader::new(dir),
        None => DylibLoader::in_cache_dir(),
    };
    let cache = ModuleCache::new(Arc::new(DefaultFetcher::new()), Arc::new(loader));

    let mut state = WorkerState::new(cache)?;
    tracing::debug!("Worker {} started", std::process::id());

    serve(&mut state, std::io::stdin().lock(), std::io::stdout().lock())?;

    tracing::debug!("Worker {} exiting", std::process::id());
    Ok(())
}
