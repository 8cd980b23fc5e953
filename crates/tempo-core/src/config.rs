//! Runtime configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional JSON
//! file, then `TEMPO_*` environment variables. Command-line flags are applied
//! on top by the binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compiler::DEFAULT_COMPILER_URL;
use crate::controller::DEFAULT_INTERVAL;
use crate::error::{Error, Result};
use crate::ipc::WORKER_PATH_ENV;
use crate::schedule::{DEFAULT_FRAME_RATE, SchedulerKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    /// Base URL of the schema compiler service.
    pub compiler_url: String,
    pub scheduler: SchedulerKind,
    /// Frames per second for the frame scheduler.
    pub frame_rate: u32,
    /// Autoplay interval when neither the config nor the command line sets one.
    pub default_interval_ms: u64,
    /// Run engines in a worker process instead of in-process.
    pub isolated: bool,
    pub worker_path: Option<PathBuf>,
    /// Where native modules are unpacked. Defaults to the user cache dir.
    pub module_dir: Option<PathBuf>,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            compiler_url: DEFAULT_COMPILER_URL.to_string(),
            scheduler: SchedulerKind::default(),
            frame_rate: DEFAULT_FRAME_RATE,
            default_interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
            isolated: false,
            worker_path: None,
            module_dir: None,
        }
    }
}

impl TempoConfig {
    /// Defaults, overlaid with `path` (if any) and then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Apply `TEMPO_*` overrides, reading variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TEMPO_COMPILER_URL") {
            self.compiler_url = url;
        }
        if let Some(kind) = lookup("TEMPO_SCHEDULER") {
            self.scheduler = kind.parse().map_err(Error::Config)?;
        }
        if let Some(rate) = lookup("TEMPO_FRAME_RATE") {
            self.frame_rate = parse_env("TEMPO_FRAME_RATE", &rate)?;
        }
        if let Some(ms) = lookup("TEMPO_INTERVAL_MS") {
            self.default_interval_ms = parse_env("TEMPO_INTERVAL_MS", &ms)?;
        }
        if let Some(flag) = lookup("TEMPO_ISOLATED") {
            self.isolated = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(path) = lookup(WORKER_PATH_ENV) {
            self.worker_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("TEMPO_MODULE_DIR") {
            self.module_dir = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}={}: {}", key, value, e)))
}
