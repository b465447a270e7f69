//! OpenAI-compatible completion server backend
//!
//! Each resource slot talks to its own server (`endpoints[resource_id]`),
//! typically one vLLM server started per GPU. Engine knobs other than the
//! model are fixed when the server starts and are not sent per request.

use std::time::Duration;

use async_trait::async_trait;
use fanout_core::{InferenceError, ResourceScope};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Completion, EngineConfig, InferenceService, SamplingParams};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URLs indexed by resource id; slots past the end use the first entry
    pub endpoints: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl HttpConfig {
    /// Base URL serving `resource_id`, or `None` when no endpoint is configured.
    pub fn endpoint_for(&self, resource_id: u32) -> Option<&str> {
        self.endpoints
            .get(resource_id as usize)
            .or_else(|| self.endpoints.first())
            .map(String::as_str)
    }
}

pub struct HttpService {
    config: HttpConfig,
    client: reqwest::Client,
}

impl HttpService {
    /// Build a client for the configured servers.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Configuration`] if the HTTP client cannot be built.
    pub fn new(config: HttpConfig) -> Result<Self, InferenceError> {
        let timeout = Duration::from_secs(
            config
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a [String],
    temperature: f32,
    top_p: f32,
    max_tokens: usize,
    skip_special_tokens: bool,
    spaces_between_special_tokens: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    index: usize,
    text: String,
}

#[async_trait]
impl InferenceService for HttpService {
    async fn generate(
        &self,
        scope: &ResourceScope,
        engine: &EngineConfig,
        prompts: &[String],
        sampling: &SamplingParams,
    ) -> Result<Vec<Completion>, InferenceError> {
        let base = self.config.endpoint_for(scope.resource_id).ok_or_else(|| {
            InferenceError::Configuration("no HTTP endpoint configured".to_string())
        })?;
        let url = format!("{}/v1/completions", base.trim_end_matches('/'));

        let body = CompletionRequest {
            model: &engine.model,
            prompt: prompts,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_tokens: sampling.max_tokens,
            skip_special_tokens: sampling.skip_special_tokens,
            spaces_between_special_tokens: sampling.spaces_between_special_tokens,
        };

        debug!(resource_id = scope.resource_id, url = %url, prompts = prompts.len(), "Sending completion request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::Inference(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(resource_id = scope.resource_id, status = status.as_u16(), "Completion request rejected");
            return Err(classify_status(status.as_u16(), &text));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Inference(format!("invalid completion response: {e}")))?;

        into_completions(prompts, parsed)
    }
}

/// Map a failed HTTP status to the error taxonomy.
fn classify_status(status: u16, body: &str) -> InferenceError {
    let message = format!("server returned {status}: {}", body.trim());
    let lowered = body.to_ascii_lowercase();
    if status == 503 || status == 507 || lowered.contains("out of memory") {
        InferenceError::ResourceExhaustion(message)
    } else if matches!(status, 400 | 404 | 422) {
        InferenceError::Configuration(message)
    } else {
        InferenceError::Inference(message)
    }
}

fn into_completions(
    prompts: &[String],
    response: CompletionResponse,
) -> Result<Vec<Completion>, InferenceError> {
    let mut choices = response.choices;
    if choices.len() != prompts.len() {
        return Err(InferenceError::Inference(format!(
            "expected {} choices, got {}",
            prompts.len(),
            choices.len()
        )));
    }
    choices.sort_by_key(|c| c.index);

    Ok(prompts
        .iter()
        .zip(choices)
        .map(|(prompt, choice)| Completion {
            prompt: prompt.clone(),
            text: choice.text,
        })
        .collect())
}
