//! Step command: back-to-back steps without a scheduler.

use std::time::Instant;

use tempo_core::validate::validate_input;
use tempo_core::{SchemaValidator, StepEngine, TempoConfig, run_iterations};

use crate::colors;
use crate::session::{self, EngineArgs};

/// Run `count` steps, printing one `{input, outputs}` line per completed step.
pub async fn execute(args: &EngineArgs, config: &TempoConfig, count: u64) -> anyhow::Result<()> {
    let mut session = session::open(args, config).await?;

    if let Some(schema) = &session.input_schema {
        validate_input(&SchemaValidator, &session.engine.snapshot().input, schema)?;
    }

    let start = Instant::now();
    let history = run_iterations(&mut session.engine, count).await;
    for entry in &history {
        println!("{}", serde_json::to_string(entry)?);
    }

    let last = session.engine.snapshot();
    let mut engine = session.engine;
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;

    if let Some(error) = last.error {
        eprintln!(
            "{}Failed{} after {} steps: {}",
            colors::RED,
            colors::RESET,
            history.len(),
            error
        );
        anyhow::bail!("{}", error);
    }

    eprintln!(
        "{}Completed{} {} steps in {:.2}s",
        colors::GREEN,
        colors::RESET,
        history.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
