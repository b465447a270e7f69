//! Error taxonomy
//!
//! Two layers:
//! - [`InferenceError`] and [`WorkError`] are per-worker. They never abort the
//!   run; they end up inside the worker's [`crate::WorkResult`]s.
//! - [`HarnessError`] means the orchestration layer itself failed and the run
//!   is aborted.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by an inference service inside a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Insufficient resources: {0}")]
    ResourceExhaustion(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Failures of the harness itself. Fatal to the whole run.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid assignments: {0}")]
    InvalidAssignments(String),

    #[error("Failed to spawn worker for resource {resource_id}: {source}")]
    Spawn {
        resource_id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to join worker for resource {resource_id}: {reason}")]
    Join { resource_id: u32, reason: String },

    #[error("IPC communication error: {0}")]
    Ipc(String),

    #[error("Failed to serialize worker request: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Category of a per-item failure carried in a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkErrorKind {
    /// Bad model identifier or generation parameters.
    Configuration,
    /// The bound hardware could not hold the workload.
    ResourceExhaustion,
    /// Generic failure from the inference service.
    Inference,
    /// The worker exceeded the harness join timeout and was killed.
    Timeout,
    /// The worker exited without reporting this item.
    WorkerLost,
}

impl WorkErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Inference => "inference",
            Self::Timeout => "timeout",
            Self::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for WorkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error descriptor attached to a failed [`crate::WorkResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkError {
    pub kind: WorkErrorKind,
    pub message: String,
}

impl WorkError {
    pub fn new(kind: WorkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl From<InferenceError> for WorkError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Configuration(msg) => Self::new(WorkErrorKind::Configuration, msg),
            InferenceError::ResourceExhaustion(msg) => {
                Self::new(WorkErrorKind::ResourceExhaustion, msg)
            }
            InferenceError::Inference(msg) => Self::new(WorkErrorKind::Inference, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_error_maps_to_kind() {
        let err: WorkError = InferenceError::ResourceExhaustion("CUDA out of memory".into()).into();
        assert_eq!(err.kind, WorkErrorKind::ResourceExhaustion);
        assert_eq!(err.message, "CUDA out of memory");

        let err: WorkError = InferenceError::Configuration("unknown model".into()).into();
        assert_eq!(err.kind, WorkErrorKind::Configuration);
    }

    #[test]
    fn test_work_error_serialization() {
        let err = WorkError::new(WorkErrorKind::WorkerLost, "exit status 1");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"worker_lost\""));

        let back: WorkError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_error_messages() {
        let spawn_err = HarnessError::Spawn {
            resource_id: 2,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "worker binary not found"),
        };
        assert!(spawn_err.to_string().contains("resource 2"));
        assert!(spawn_err.to_string().contains("not found"));

        let err = WorkError::new(WorkErrorKind::Timeout, "killed after 5s");
        assert_eq!(err.to_string(), "[timeout] killed after 5s");
    }
}
