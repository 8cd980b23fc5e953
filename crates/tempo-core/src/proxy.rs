//! Engine proxy forwarding every operation to an isolated worker.
//!
//! ```text
//!  EngineProxy ──Request──▶ courier thread ──WorkerChannel::call──▶ worker
//!       ▲                        │
//!       └──── oneshot reply ─────┘
//! ```
//!
//! The courier owns the channel and handles one request at a time, so
//! responses arrive in request order. The proxy keeps a mirror of the last
//! snapshot so `snapshot()` never blocks.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::engine::StepEngine;
use crate::error::{Error, Result};
use crate::ipc::{WorkerChannel, WorkerCommand, WorkerHandle, WorkerResponse, expect_snapshot};
use crate::types::{EngineSnapshot, ExecutionConfig, OutputSpec, Record};

struct Request {
    command: WorkerCommand,
    // `None` for fire-and-forget commands.
    reply: Option<oneshot::Sender<Result<WorkerResponse>>>,
}

/// [`StepEngine`] whose steps run in a worker.
pub struct EngineProxy {
    requests: Option<mpsc::Sender<Request>>,
    courier: Option<JoinHandle<()>>,
    mirror: EngineSnapshot,
}

impl EngineProxy {
    /// Take ownership of `channel` and bind the worker's engine.
    ///
    /// Fails when the worker cannot load `location` or does not answer.
    pub async fn start(
        channel: Box<dyn WorkerChannel>,
        location: &str,
        output_spec: &OutputSpec,
        config: &ExecutionConfig,
        initial_input: &Record,
    ) -> Result<Self> {
        let init = WorkerCommand::init(location, output_spec, config, initial_input)?;

        let (requests, inbox) = mpsc::channel();
        let courier = std::thread::Builder::new()
            .name("tempo-courier".to_string())
            .spawn(move || run_courier(channel, inbox))?;

        let mut proxy = Self {
            requests: Some(requests),
            courier: Some(courier),
            mirror: EngineSnapshot {
                input: initial_input.clone(),
                ..Default::default()
            },
        };

        proxy.mirror = proxy.request(init).await.and_then(expect_snapshot)?;
        tracing::info!("Worker engine bound to {}", location);
        Ok(proxy)
    }

    /// Spawn a `tempo-worker` process and bind it.
    pub async fn spawn_process(
        worker_path: Option<PathBuf>,
        location: &str,
        output_spec: &OutputSpec,
        config: &ExecutionConfig,
        initial_input: &Record,
    ) -> Result<Self> {
        let handle = tokio::task::spawn_blocking(move || WorkerHandle::spawn(worker_path.as_deref()))
            .await
            .map_err(|e| Error::Ipc(format!("Worker spawn task failed: {}", e)))??;
        tracing::debug!("Spawned worker process {}", handle.pid());

        Self::start(Box::new(handle), location, output_spec, config, initial_input).await
    }

    /// Whether the worker link is still open.
    pub fn is_running(&self) -> bool {
        self.requests.is_some()
    }

    async fn request(&self, command: WorkerCommand) -> Result<WorkerResponse> {
        let (reply, response) = oneshot::channel();
        self.requests
            .as_ref()
            .ok_or_else(|| Error::Ipc("Worker has been shut down".to_string()))?
            .send(Request {
                command,
                reply: Some(reply),
            })
            .map_err(|_| Error::Ipc("Worker courier stopped".to_string()))?;

        response
            .await
            .map_err(|_| Error::Ipc("Worker courier stopped".to_string()))?
    }

    fn post(&self, command: Result<WorkerCommand>) {
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Dropping worker command: {}", e);
                return;
            }
        };
        if let Some(requests) = &self.requests
            && requests.send(Request { command, reply: None }).is_err()
        {
            tracing::warn!("Worker courier stopped");
        }
    }
}

fn run_courier(mut channel: Box<dyn WorkerChannel>, inbox: mpsc::Receiver<Request>) {
    for Request { command, reply } in inbox {
        let kind = command.kind();
        let shutdown = matches!(command, WorkerCommand::Shutdown);
        let result = channel.call(command);

        match (reply, result) {
            (Some(reply), result) => {
                let _ = reply.send(result);
            }
            (None, Ok(WorkerResponse::Error { message })) => {
                tracing::warn!("Worker rejected {}: {}", kind, message);
            }
            (None, Err(e)) => tracing::warn!("Worker {} failed: {}", kind, e),
            (None, Ok(_)) => {}
        }

        if shutdown {
            break;
        }
    }

    channel.terminate();
    tracing::debug!("Courier stopped");
}

impl StepEngine for EngineProxy {
    fn snapshot(&self) -> EngineSnapshot {
        self.mirror.clone()
    }

    /// Applied to the mirror immediately; the worker receives it before the
    /// next step. The step count is kept.
    fn set_input(&mut self, input: Record) {
        self.post(WorkerCommand::set_input(&input));
        self.mirror = EngineSnapshot {
            step_count: self.mirror.step_count,
            input,
            outputs: None,
            error: None,
        };
    }

    fn set_config(&mut self, config: ExecutionConfig) {
        self.post(WorkerCommand::set_config(&config));
    }

    fn step(&mut self) -> BoxFuture<'_, EngineSnapshot> {
        async move {
            let snapshot = match self.request(WorkerCommand::Step).await {
                Ok(WorkerResponse::Error { message }) => self.mirror.with_error(message),
                Ok(response) => {
                    expect_snapshot(response).unwrap_or_else(|e| self.mirror.with_error(e.to_string()))
                }
                Err(e) => self.mirror.with_error(e.to_string()),
            };
            self.mirror = snapshot.clone();
            snapshot
        }
        .boxed()
    }

    /// Stop the worker and wait for the courier to exit. Idempotent.
    fn shutdown(&mut self) {
        let Some(requests) = self.requests.take() else {
            return;
        };
        let _ = requests.send(Request {
            command: WorkerCommand::Shutdown,
            reply: None,
        });
        drop(requests);

        if let Some(courier) = self.courier.take()
            && courier.join().is_err()
        {
            tracing::warn!("Courier thread panicked");
        }
        tracing::debug!("Engine proxy shut down");
    }
}

impl Drop for EngineProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
