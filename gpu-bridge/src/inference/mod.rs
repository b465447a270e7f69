//! Inference service seam
//!
//! Workers treat model loading, tokenization and sampling as one opaque
//! external capability: [`InferenceService::generate`]. The backend a worker
//! builds is chosen by the [`BackendConfig`] sent with its request.

mod echo;
mod http;
mod params;
mod subprocess;

pub use echo::{EchoConfig, EchoService};
pub use http::{HttpConfig, HttpService};
pub use params::{EngineConfig, SamplingParams};
pub use subprocess::{SubprocessConfig, SubprocessService};

use async_trait::async_trait;
use fanout_core::{InferenceError, ResourceScope, WorkAssignment};
use serde::{Deserialize, Serialize};

/// Metadata key holding the [`EngineConfig`]
pub const ENGINE_KEY: &str = "engine";

/// Metadata key holding the [`SamplingParams`]
pub const SAMPLING_KEY: &str = "sampling";

/// Metadata key holding an optional warmup prompt
pub const WARMUP_KEY: &str = "warmup_prompt";

/// One generated output, in prompt order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub prompt: String,
    pub text: String,
}

/// External text-generation capability invoked by a worker.
///
/// Implementations must only use the hardware named in `scope`.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Generate one completion per prompt.
    ///
    /// # Arguments
    ///
    /// * `scope` - Devices this call may use
    /// * `engine` - Model and engine settings, already validated
    /// * `prompts` - Inputs, answered in order
    /// * `sampling` - Generation parameters shared by all prompts
    ///
    /// # Errors
    ///
    /// Failures are classified as configuration, resource exhaustion or
    /// generic inference errors; the worker tags every item with the kind.
    async fn generate(
        &self,
        scope: &ResourceScope,
        engine: &EngineConfig,
        prompts: &[String],
        sampling: &SamplingParams,
    ) -> Result<Vec<Completion>, InferenceError>;
}

/// Backend selection, sent to every worker of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Deterministic echo, for dry runs and tests
    Echo(EchoConfig),
    /// OpenAI-compatible completion server (e.g. a vLLM server per GPU)
    Http(HttpConfig),
    /// External generator program (e.g. a vLLM script)
    Subprocess(SubprocessConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Echo(EchoConfig::default())
    }
}

impl BackendConfig {
    /// Short backend name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Echo(_) => "echo",
            Self::Http(_) => "http",
            Self::Subprocess(_) => "subprocess",
        }
    }

    /// Instantiate the service inside a worker.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Configuration`] if the backend cannot be set up
    /// (for example an HTTP client that fails to build).
    pub fn build(&self) -> Result<Box<dyn InferenceService>, InferenceError> {
        Ok(match self {
            Self::Echo(config) => Box::new(EchoService::new(config.clone())),
            Self::Http(config) => Box::new(HttpService::new(config.clone())?),
            Self::Subprocess(config) => Box::new(SubprocessService::new(config.clone())),
        })
    }
}

/// Assignment carrying engine and sampling settings in its metadata.
///
/// # Arguments
///
/// * `resource_id` - Slot the assignment is bound to
/// * `prompts` - Work items for the worker
/// * `engine` - Stored under [`ENGINE_KEY`] (the model id also under `"model"`)
/// * `sampling` - Stored under [`SAMPLING_KEY`]
///
/// # Errors
///
/// Returns an error if the settings cannot be serialized to JSON.
pub fn build_assignment(
    resource_id: u32,
    prompts: Vec<String>,
    engine: &EngineConfig,
    sampling: &SamplingParams,
) -> Result<WorkAssignment, serde_json::Error> {
    WorkAssignment::new(resource_id, prompts)
        .with_metadata("model", &engine.model)?
        .with_metadata(ENGINE_KEY, engine)?
        .with_metadata(SAMPLING_KEY, sampling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config_is_tagged() {
        let backend = BackendConfig::Http(HttpConfig {
            endpoints: vec!["http://127.0.0.1:8000".to_string()],
            ..Default::default()
        });
        let json = serde_json::to_value(&backend).unwrap();
        assert_eq!(json["kind"], "http");
        assert_eq!(json["endpoints"][0], "http://127.0.0.1:8000");

        let back: BackendConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, backend);
    }

    #[test]
    fn test_build_assignment_metadata() {
        let engine = EngineConfig::new("Qwen/Qwen2.5-7B-Instruct");
        let sampling = SamplingParams::default();
        let assignment = build_assignment(1, vec!["q".to_string()], &engine, &sampling).unwrap();

        assert_eq!(assignment.metadata_str("model"), Some("Qwen/Qwen2.5-7B-Instruct"));
        assert_eq!(
            assignment.metadata_as::<EngineConfig>(ENGINE_KEY).unwrap(),
            Some(engine)
        );
        assert_eq!(
            assignment.metadata_as::<SamplingParams>(SAMPLING_KEY).unwrap(),
            Some(sampling)
        );
    }
}
