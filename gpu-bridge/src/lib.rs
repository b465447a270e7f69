//! GPU Bridge - Process-per-GPU Fan-out for Inference Workers
//!
//! This crate provides a [`Harness`] that runs independent inference workloads
//! in parallel, one OS process per hardware slot, and merges their outputs
//! into one ordered [`ResultSet`](fanout_core::ResultSet).
//!
//! # Architecture
//!
//! Each workload runs in its own worker process to:
//! - Give every worker exclusive ownership of its device(s)
//! - Keep device visibility process-local (`CUDA_VISIBLE_DEVICES` is set on
//!   the child command, never on the parent)
//! - Enable fault isolation (a crashing worker cannot take siblings down)
//!
//! The harness and its workers talk over the child's stdin/stdout with
//! length-prefixed JSON frames (see [`workers::ipc`]).
//!
//! # Example
//!
//! ```ignore
//! use gpu_bridge::{BackendConfig, Harness, HarnessConfig, WorkerCommand};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let worker = WorkerCommand::current_exe()?.arg("worker");
//!     let harness = Harness::new(worker, HarnessConfig::from_env()?);
//!
//!     let results = harness.run(assignments, &BackendConfig::default()).await?;
//!     for result in &results {
//!         println!("{}: {:?}", result.resource_id, result.output());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod inference;
pub mod workers;

// Re-export main types for convenience
pub use config::{ConfigError, HarnessConfig};
pub use inference::{
    build_assignment, BackendConfig, Completion, EchoConfig, EngineConfig, HttpConfig,
    InferenceService, SamplingParams, SubprocessConfig,
};
pub use workers::{run_worker, Harness, IpcError, WorkerCommand, WorkerRequest};
