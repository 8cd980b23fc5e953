//! Tempo CLI - headless driver for the iterative execution loop.

mod colors;
mod compile;
mod run;
mod session;
mod step;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use session::EngineArgs;

#[derive(Parser)]
#[command(name = "tempo")]
#[command(about = "Run compiled computations step by step with output feedback")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a module on a schedule, printing each snapshot as a JSON line
    Run {
        #[command(flatten)]
        engine: EngineArgs,

        /// Stop after this many steps
        #[arg(short = 'n', long)]
        iterations: Option<u64>,

        /// Milliseconds between steps (overrides the execution config)
        #[arg(long)]
        interval: Option<u64>,

        /// Scheduler: timer or frame
        #[arg(long)]
        scheduler: Option<tempo_core::SchedulerKind>,
    },

    /// Run a fixed number of steps back to back, printing the history
    Step {
        #[command(flatten)]
        engine: EngineArgs,

        /// Number of steps
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,
    },

    /// Compile a schema with the compiler service
    Compile {
        /// Path to the schema source
        schema: PathBuf,

        /// Compiler base URL (overrides configuration)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries snapshots; logs go to stderr.
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = tempo_core::TempoConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            engine,
            iterations,
            interval,
            scheduler,
        } => {
            if let Some(kind) = scheduler {
                config.scheduler = kind;
            }
            run::execute(&engine, &config, iterations, interval).await?;
        }

        Commands::Step { engine, count } => {
            step::execute(&engine, &config, count).await?;
        }

        Commands::Compile { schema, url } => {
            if let Some(url) = url {
                config.compiler_url = url;
            }
            compile::execute(&schema, &config).await?;
        }
    }

    Ok(())
}
