//! Messages exchanged with an isolated worker.
//!
//! Frames are length-prefixed rkyv: a 4-byte little-endian length followed by
//! the encoded message. Records, configs and snapshots travel as JSON bytes
//! inside the frame since their values are arbitrary JSON.

use std::io::{ErrorKind, Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{EngineSnapshot, ExecutionConfig, OutputSpec, Record};

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Request sent from the proxy to the worker.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Load a module and bind a fresh engine to it.
    Init {
        location: String,
        output_spec_json: Vec<u8>,
        config_json: Vec<u8>,
        input_json: Vec<u8>,
    },

    /// Replace the engine's input.
    SetInput { input_json: Vec<u8> },

    /// Replace the engine's execution config.
    SetConfig { config_json: Vec<u8> },

    /// Run one step.
    Step,

    Ping,

    /// Exit the serve loop.
    Shutdown,
}

/// Reply to a [`WorkerCommand`], always in request order.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Engine snapshot after `Init`, `SetInput` or `Step`.
    Snapshot { snapshot_json: Vec<u8> },

    /// `SetConfig` applied.
    Ack,

    /// The command could not be carried out.
    Error { message: String },

    Pong,

    ShuttingDown,
}

impl WorkerCommand {
    pub fn init(
        location: &str,
        output_spec: &OutputSpec,
        config: &ExecutionConfig,
        input: &Record,
    ) -> Result<Self> {
        Ok(Self::Init {
            location: location.to_string(),
            output_spec_json: serde_json::to_vec(output_spec)?,
            config_json: serde_json::to_vec(config)?,
            input_json: serde_json::to_vec(input)?,
        })
    }

    pub fn set_input(input: &Record) -> Result<Self> {
        Ok(Self::SetInput {
            input_json: serde_json::to_vec(input)?,
        })
    }

    pub fn set_config(config: &ExecutionConfig) -> Result<Self> {
        Ok(Self::SetConfig {
            config_json: serde_json::to_vec(config)?,
        })
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::SetInput { .. } => "set_input",
            Self::SetConfig { .. } => "set_config",
            Self::Step => "step",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
        }
    }
}

impl WorkerResponse {
    pub fn snapshot(snapshot: &EngineSnapshot) -> Result<Self> {
        Ok(Self::Snapshot {
            snapshot_json: serde_json::to_vec(snapshot)?,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Decode a `Snapshot` response; any other response is an error.
pub fn expect_snapshot(response: WorkerResponse) -> Result<EngineSnapshot> {
    match response {
        WorkerResponse::Snapshot { snapshot_json } => Ok(serde_json::from_slice(&snapshot_json)?),
        WorkerResponse::Error { message } => Err(Error::Ipc(message)),
        other => Err(Error::Ipc(format!("Unexpected response from worker: {:?}", other))),
    }
}

/// Write one length-prefixed frame and flush.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode frame: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("Frame too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .and_then(|_| writer.write_all(&bytes))
        .and_then(|_| writer.flush())
        .map_err(|e| Error::Ipc(format!("Failed to write frame: {}", e)))?;

    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
///
/// # Safety
///
/// Frames are decoded without validation; only read from our own workers.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<Option<T>>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read frame length: {}", e))),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("Frame too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read frame body: {}", e)))?;

    // SAFETY: frames come from a worker spawned by this crate, which encodes
    // them with `write_message` for the same types.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode frame: {}", e)))?;

    Ok(Some(message))
}
