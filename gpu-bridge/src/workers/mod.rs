//! Worker processes for parallel inference
//!
//! - [`harness`]: parent side, spawns one worker per resource and merges results
//! - [`worker`]: child side, runs the inference call inside its resource scope
//! - [`ipc`]: framing and messages shared by both sides

mod harness;
pub mod ipc;
mod worker;

pub use harness::{Harness, WorkerCommand};
pub use ipc::{IpcError, WorkerRequest};
pub use worker::{process_request, run_worker};

/// Device visibility variable set on every worker process.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";
