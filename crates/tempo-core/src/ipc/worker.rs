//! Isolated execution contexts.
//!
//! A worker hosts one [`Engine`] and answers [`WorkerCommand`]s one at a time.
//! The same [`WorkerState`] runs either in a child process (`tempo-worker`,
//! reached through [`WorkerHandle`]) or on a dedicated thread
//! ([`ThreadChannel`]).

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::module::ModuleCache;
use crate::types::{ExecutionConfig, OutputSpec, Record};

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

/// Environment variable naming the worker binary.
pub const WORKER_PATH_ENV: &str = "TEMPO_WORKER_PATH";

const WORKER_BIN: &str = if cfg!(windows) { "tempo-worker.exe" } else { "tempo-worker" };

const NOT_INITIALIZED: &str = "engine not initialized";

/// Worker-side state: the module cache and the bound engine.
pub struct WorkerState {
    runtime: Runtime,
    cache: ModuleCache,
    engine: Option<Engine>,
}

impl WorkerState {
    /// Must not be called from inside an async context; module loads block on
    /// a private runtime.
    pub fn new(cache: ModuleCache) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            cache,
            engine: None,
        })
    }

    /// Carry out one command. Failures become [`WorkerResponse::Error`].
    pub fn handle(&mut self, command: WorkerCommand) -> WorkerResponse {
        let kind = command.kind();
        self.try_handle(command).unwrap_or_else(|e| {
            tracing::debug!("Worker {} failed: {}", kind, e);
            WorkerResponse::error(e.to_string())
        })
    }

    fn try_handle(&mut self, command: WorkerCommand) -> Result<WorkerResponse> {
        match command {
            WorkerCommand::Init {
                location,
                output_spec_json,
                config_json,
                input_json,
            } => {
                let output_spec: OutputSpec = serde_json::from_slice(&output_spec_json)?;
                let config: ExecutionConfig = serde_json::from_slice(&config_json)?;
                let input: Record = serde_json::from_slice(&input_json)?;

                let module = self.runtime.block_on(self.cache.load(&location))?;
                tracing::info!("Worker bound to {}", location);

                let engine = Engine::new(module, output_spec, config, input);
                let response = WorkerResponse::snapshot(&engine.snapshot());
                self.engine = Some(engine);
                response
            }
            WorkerCommand::SetInput { input_json } => {
                let Some(engine) = self.engine.as_mut() else {
                    return Ok(WorkerResponse::error(NOT_INITIALIZED));
                };
                engine.set_input(serde_json::from_slice(&input_json)?);
                WorkerResponse::snapshot(&engine.snapshot())
            }
            WorkerCommand::SetConfig { config_json } => {
                let Some(engine) = self.engine.as_mut() else {
                    return Ok(WorkerResponse::error(NOT_INITIALIZED));
                };
                engine.set_config(serde_json::from_slice(&config_json)?);
                Ok(WorkerResponse::Ack)
            }
            WorkerCommand::Step => match self.engine.as_mut() {
                Some(engine) => WorkerResponse::snapshot(&engine.step()),
                None => Ok(WorkerResponse::error(NOT_INITIALIZED)),
            },
            WorkerCommand::Ping => Ok(WorkerResponse::Pong),
            WorkerCommand::Shutdown => Ok(WorkerResponse::ShuttingDown),
        }
    }
}

/// Answer framed commands from `reader` until `Shutdown` or end of stream.
pub fn serve<R: Read, W: Write>(state: &mut WorkerState, reader: R, writer: W) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let Some(command) = read_message::<_, WorkerCommand>(&mut reader)? else {
            tracing::debug!("Command stream closed");
            return Ok(());
        };

        let shutdown = matches!(command, WorkerCommand::Shutdown);
        let response = state.handle(command);
        write_message(&mut writer, &response)?;

        if shutdown {
            return Ok(());
        }
    }
}

/// Synchronous request/response link to a worker.
pub trait WorkerChannel: Send {
    /// Send one command and wait for its response.
    fn call(&mut self, command: WorkerCommand) -> Result<WorkerResponse>;

    /// Tear the worker down. Called once the link is no longer needed.
    fn terminate(&mut self) {}
}

/// Handle to a `tempo-worker` child process.
pub struct WorkerHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    killed: bool,
}

impl WorkerHandle {
    /// Spawn a worker and check it answers a ping.
    ///
    /// The binary is `explicit` when given, otherwise the first of:
    /// 1. `TEMPO_WORKER_PATH`
    /// 2. next to the current executable
    /// 3. `PATH`
    /// 4. the workspace `target/` directory (development)
    pub fn spawn(explicit: Option<&Path>) -> Result<Self> {
        let worker_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => find_worker_binary()?,
        };

        let mut child = Command::new(&worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let mut handle = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            killed: false,
        };

        match handle.call(WorkerCommand::Ping)? {
            WorkerResponse::Pong => {
                tracing::debug!("Worker {} ready", handle.pid());
                Ok(handle)
            }
            other => Err(Error::Ipc(format!(
                "Unexpected response from worker: {:?}",
                other
            ))),
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        !self.killed && matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the worker to exit, then kill and reap it.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        let _ = write_message(&mut self.stdin, &WorkerCommand::Shutdown);
        std::thread::sleep(Duration::from_millis(10));

        if let Err(e) = self.child.kill() {
            // Already exited after the shutdown request.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker: {}", e);
            }
        }
        let _ = self.child.wait();
    }
}

impl WorkerChannel for WorkerHandle {
    fn call(&mut self, command: WorkerCommand) -> Result<WorkerResponse> {
        if self.killed {
            return Err(Error::Ipc("Worker has been terminated".to_string()));
        }
        write_message(&mut self.stdin, &command)?;
        read_message(&mut self.stdout)?
            .ok_or_else(|| Error::Ipc("Worker exited unexpectedly".to_string()))
    }

    fn terminate(&mut self) {
        self.kill();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("{} points to missing file {}", WORKER_PATH_ENV, path.display());
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let candidates = [exe_dir.join(WORKER_BIN), exe_dir.join("..").join(WORKER_BIN)];
        if let Some(path) = candidates.into_iter().find(|p| p.exists()) {
            return Ok(path);
        }
    }

    if let Ok(path) = which::which(WORKER_BIN) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let target = PathBuf::from(manifest_dir).join("..").join("..").join("target");
        for profile in ["debug", "release"] {
            let path = target.join(profile).join(WORKER_BIN);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(Error::Ipc(format!(
        "Could not find {}. Build it with `cargo build -p tempo-worker` or set {}.",
        WORKER_BIN, WORKER_PATH_ENV
    )))
}

/// Worker hosted on a dedicated OS thread of this process.
pub struct ThreadChannel {
    commands: Option<mpsc::Sender<WorkerCommand>>,
    responses: mpsc::Receiver<WorkerResponse>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadChannel {
    pub fn spawn(cache: ModuleCache) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (response_tx, response_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), String>>(1);

        let thread = std::thread::Builder::new()
            .name("tempo-worker".to_string())
            .spawn(move || {
                let mut state = match WorkerState::new(cache) {
                    Ok(state) => {
                        let _ = ready_tx.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                for command in command_rx {
                    let shutdown = matches!(command, WorkerCommand::Shutdown);
                    if response_tx.send(state.handle(command)).is_err() || shutdown {
                        break;
                    }
                }
                tracing::debug!("Worker thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(Error::Ipc(message)),
            Err(_) => return Err(Error::Ipc("Worker thread exited during startup".to_string())),
        }

        Ok(Self {
            commands: Some(command_tx),
            responses: response_rx,
            thread: Some(thread),
        })
    }
}

impl WorkerChannel for ThreadChannel {
    fn call(&mut self, command: WorkerCommand) -> Result<WorkerResponse> {
        let closed = || Error::Ipc("Worker thread has exited".to_string());
        self.commands
            .as_ref()
            .ok_or_else(closed)?
            .send(command)
            .map_err(|_| closed())?;
        self.responses.recv().map_err(|_| closed())
    }

    fn terminate(&mut self) {
        self.commands.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Worker thread panicked");
        }
    }
}

impl Drop for ThreadChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}
