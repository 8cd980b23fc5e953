//! Communication with isolated workers.
//!
//! The proxy side talks to a worker through a [`WorkerChannel`]; the worker
//! side runs a [`WorkerState`] behind [`serve`] (child process) or a
//! [`ThreadChannel`] (in-process thread).

pub mod protocol;
mod worker;

pub use protocol::{
    MAX_FRAME_LEN, WorkerCommand, WorkerResponse, expect_snapshot, read_message, write_message,
};
pub use worker::{ThreadChannel, WORKER_PATH_ENV, WorkerChannel, WorkerHandle, WorkerState, serve};
