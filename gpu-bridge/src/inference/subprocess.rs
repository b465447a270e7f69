//! External generator program backend
//!
//! Runs a generator (for example a Python script driving vLLM) once per
//! call, restricted to the scope's devices through its own environment.
//!
//! The program reads one JSON request on stdin and prints one JSON response:
//! - `{"completions": ["...", ...]}` in prompt order, or
//! - `{"error": {"kind": "configuration" | "resource_exhaustion" | ..., "message": "..."}}`
//!
//! The request is written while stdout and stderr are being collected, so a
//! generator may log freely before it reads its input.

use std::process::Stdio;

use async_trait::async_trait;
use fanout_core::{InferenceError, ResourceScope};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Completion, EngineConfig, InferenceService, SamplingParams};
use crate::workers::VISIBLE_DEVICES_ENV;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Generator executable, resolved through `PATH`
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

pub struct SubprocessService {
    config: SubprocessConfig,
}

impl SubprocessService {
    /// Create a service that starts `config.program` once per generation call.
    pub const fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }
}

#[derive(Serialize)]
struct GeneratorRequest<'a> {
    engine: &'a EngineConfig,
    sampling: &'a SamplingParams,
    prompts: &'a [String],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeneratorResponse {
    Completions { completions: Vec<String> },
    Error { error: GeneratorError },
}

#[derive(Deserialize)]
struct GeneratorError {
    #[serde(default)]
    kind: String,
    message: String,
}

#[async_trait]
impl InferenceService for SubprocessService {
    async fn generate(
        &self,
        scope: &ResourceScope,
        engine: &EngineConfig,
        prompts: &[String],
        sampling: &SamplingParams,
    ) -> Result<Vec<Completion>, InferenceError> {
        let request = serde_json::to_vec(&GeneratorRequest {
            engine,
            sampling,
            prompts,
        })
        .map_err(|e| InferenceError::Configuration(format!("cannot encode request: {e}")))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env(VISIBLE_DEVICES_ENV, scope.visible_devices())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InferenceError::Configuration(format!(
                    "cannot start generator {}: {e}",
                    self.config.program
                ))
            })?;

        info!(
            resource_id = scope.resource_id,
            pid = child.id(),
            model = %engine.model,
            "Generator process spawned"
        );

        let stdin = child.stdin.take();
        let send = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&request).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (sent, output) = tokio::join!(send, child.wait_with_output());
        let output = output
            .map_err(|e| InferenceError::Inference(format!("generator did not finish: {e}")))?;
        // A generator that exits without reading its input is judged by its output alone.
        if let Err(e) = sent {
            debug!(error = %e, "Generator did not take the whole request");
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, stderr_bytes = output.stderr.len(), "Generator exited");

        match serde_json::from_slice::<GeneratorResponse>(&output.stdout) {
            Ok(GeneratorResponse::Completions { completions }) => {
                if completions.len() != prompts.len() {
                    return Err(InferenceError::Inference(format!(
                        "expected {} completions, got {}",
                        prompts.len(),
                        completions.len()
                    )));
                }
                Ok(prompts
                    .iter()
                    .zip(completions)
                    .map(|(prompt, text)| Completion {
                        prompt: prompt.clone(),
                        text,
                    })
                    .collect())
            }
            Ok(GeneratorResponse::Error { error }) => Err(classify(&error.kind, error.message)),
            Err(_) => {
                let tail = stderr.lines().last().unwrap_or_default().trim().to_string();
                let message = format!("generator exited with {}: {tail}", output.status);
                if stderr.to_ascii_lowercase().contains("out of memory") {
                    Err(InferenceError::ResourceExhaustion(message))
                } else {
                    Err(InferenceError::Inference(message))
                }
            }
        }
    }
}

fn classify(kind: &str, message: String) -> InferenceError {
    match kind {
        "configuration" => InferenceError::Configuration(message),
        "resource_exhaustion" => InferenceError::ResourceExhaustion(message),
        _ => InferenceError::Inference(message),
    }
}
