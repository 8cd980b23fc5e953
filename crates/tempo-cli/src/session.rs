//! Engine setup shared by `run` and `step`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use serde::de::DeserializeOwned;
use tempo_core::module::{DefaultFetcher, DylibLoader, ModuleCache};
use tempo_core::{
    Engine, EngineProxy, ExecutionConfig, InputSchema, OutputSpec, Record, StepEngine, TempoConfig,
};

#[derive(Args)]
pub struct EngineArgs {
    /// Compiled module location (URL or path)
    #[arg(long)]
    pub artifact: String,

    /// Output spec (JSON object of output name -> descriptor)
    #[arg(long)]
    pub outputs: PathBuf,

    /// Execution config (JSON); defaults to single mode
    #[arg(long)]
    pub exec: Option<PathBuf>,

    /// Initial input record (JSON object)
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Input form schema (JSON) used to validate input before each step
    #[arg(long)]
    pub input_schema: Option<PathBuf>,

    /// Run the engine in a separate worker process
    #[arg(long)]
    pub isolated: bool,
}

pub struct Session {
    pub engine: Box<dyn StepEngine>,
    pub exec: ExecutionConfig,
    pub input_schema: Option<InputSchema>,
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} from {}", what, path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid {} in {}", what, path.display()))
}

fn read_optional<T: DeserializeOwned + Default>(path: Option<&Path>, what: &str) -> anyhow::Result<T> {
    path.map_or_else(|| Ok(T::default()), |path| read_json(path, what))
}

/// Load the module and bind an engine (in-process or in a worker).
pub async fn open(args: &EngineArgs, config: &TempoConfig) -> anyhow::Result<Session> {
    let output_spec: OutputSpec = read_json(&args.outputs, "output spec")?;
    let exec: ExecutionConfig = read_optional(args.exec.as_deref(), "execution config")?;
    let input: Record = read_optional(args.input.as_deref(), "input")?;
    let input_schema = args
        .input_schema
        .as_deref()
        .map(|path| read_json::<InputSchema>(path, "input schema"))
        .transpose()?;

    let engine: Box<dyn StepEngine> = if args.isolated || config.isolated {
        let proxy = EngineProxy::spawn_process(
            config.worker_path.clone(),
            &args.artifact,
            &output_spec,
            &exec,
            &input,
        )
        .await
        .with_context(|| format!("Failed to start worker for {}", args.artifact))?;
        Box::new(proxy)
    } else {
        let loader = match &config.module_dir {
            Some(dir) => DylibLoader::new(dir.clone()),
            None => DylibLoader::in_cache_dir(),
        };
        let cache = ModuleCache::new(Arc::new(DefaultFetcher::new()), Arc::new(loader));
        let module = cache
            .load(&args.artifact)
            .await
            .with_context(|| format!("Failed to load {}", args.artifact))?;
        Box::new(Engine::new(module, output_spec, exec.clone(), input))
    };

    tracing::info!("Engine ready for {}", args.artifact);

    Ok(Session {
        engine,
        exec,
        input_schema,
    })
}
