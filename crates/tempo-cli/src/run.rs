//! Run command: autoplay under a scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempo_core::controller::playback_interval;
use tempo_core::{Controller, EngineSnapshot, SchemaValidator, TempoConfig};
use tokio::sync::mpsc;

use crate::colors;
use crate::session::{self, EngineArgs};

fn print_snapshot(snapshot: &EngineSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("Failed to encode snapshot: {}", e),
    }
}

/// Execute a module on a schedule until the step limit, an error, or Ctrl-C.
pub async fn execute(
    args: &EngineArgs,
    config: &TempoConfig,
    iterations: Option<u64>,
    interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let session = session::open(args, config).await?;

    let interval = match interval_ms {
        Some(ms) => Duration::from_millis(ms),
        None if session.exec.playback_speed().is_some() => playback_interval(&session.exec),
        None => config.default_interval(),
    };
    let limit = match (iterations, session.exec.max_iterations()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    let mut controller = Controller::new(config.scheduler.build(config.frame_rate));
    if let Some(schema) = session.input_schema {
        controller = controller.with_validator(Arc::new(SchemaValidator), schema);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = controller.subscribe(move |snapshot| {
        print_snapshot(snapshot);
        let _ = tx.send(snapshot.step_count);
    });

    controller.init(session.engine, None).await;

    if limit != Some(0) {
        tracing::debug!("Playing every {:?}, limit {:?}", interval, limit);
        controller.play_limited(interval, limit);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    // Playback stops on its own at the limit or on an error.
                    if received.is_none() || !controller.is_playing() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    controller.pause();
                    break;
                }
            }
        }
    }

    let last = controller.last_snapshot();
    controller.destroy().await;

    if let Some(error) = last.error {
        eprintln!(
            "{}Stopped{} at step {}: {}",
            colors::RED,
            colors::RESET,
            last.step_count,
            error
        );
        anyhow::bail!("{}", error);
    }

    eprintln!(
        "{}Completed{} {} steps in {:.2}s",
        colors::GREEN,
        colors::RESET,
        last.step_count,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
