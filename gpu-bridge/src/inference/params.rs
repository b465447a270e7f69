//! Engine and sampling settings

use fanout_core::{InferenceError, ResourceScope};
use serde::{Deserialize, Serialize};

/// Engine construction knobs (context length, memory fraction, batching, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model identifier (e.g. a HuggingFace repo id)
    pub model: String,

    /// Number of devices one model instance is split across
    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: u32,

    #[serde(default = "default_true")]
    pub trust_remote_code: bool,

    /// Context window
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Fraction of device memory the engine may claim, in `(0, 1]`
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f32,

    /// CPU swap space in GB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_space_gb: Option<u32>,

    /// KV cache block size in tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,

    #[serde(default)]
    pub enable_prefix_caching: bool,

    #[serde(default)]
    pub enable_chunked_prefill: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_batched_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_seqs: Option<usize>,

    #[serde(default)]
    pub disable_log_stats: bool,

    #[serde(default)]
    pub enforce_eager: bool,

    #[serde(default)]
    pub disable_custom_all_reduce: bool,
}

const fn default_tensor_parallel_size() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_max_model_len() -> usize {
    4096
}

const fn default_gpu_memory_utilization() -> f32 {
    0.85
}

impl EngineConfig {
    /// Single-device engine with a 4096 token context and 85% memory.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tensor_parallel_size: default_tensor_parallel_size(),
            trust_remote_code: true,
            max_model_len: default_max_model_len(),
            gpu_memory_utilization: default_gpu_memory_utilization(),
            swap_space_gb: None,
            block_size: None,
            enable_prefix_caching: false,
            enable_chunked_prefill: false,
            max_num_batched_tokens: None,
            max_num_seqs: None,
            disable_log_stats: false,
            enforce_eager: false,
            disable_custom_all_reduce: false,
        }
    }

    /// Reject settings the engine would refuse for this scope.
    ///
    /// Runs in the worker before any generation call, so a bad setting costs
    /// no model load.
    ///
    /// # Arguments
    ///
    /// * `scope` - Devices owned by the worker; bounds `tensor_parallel_size`
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Configuration`] if:
    /// - The model identifier is empty
    /// - `tensor_parallel_size` is zero or larger than the scope's device count
    /// - `gpu_memory_utilization` is outside `(0, 1]`
    /// - `max_model_len` is zero
    /// - `block_size` is not a power of two
    /// - Batched tokens cannot hold one full context without chunked prefill
    pub fn validate(&self, scope: &ResourceScope) -> Result<(), InferenceError> {
        if self.model.trim().is_empty() {
            return Err(InferenceError::Configuration(
                "model identifier is empty".to_string(),
            ));
        }
        if self.tensor_parallel_size == 0 {
            return Err(InferenceError::Configuration(
                "tensor_parallel_size must be at least 1".to_string(),
            ));
        }
        if self.tensor_parallel_size as usize > scope.device_count() {
            return Err(InferenceError::Configuration(format!(
                "tensor_parallel_size {} exceeds the {} device(s) owned by resource {}",
                self.tensor_parallel_size,
                scope.device_count(),
                scope.resource_id
            )));
        }
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(InferenceError::Configuration(format!(
                "gpu_memory_utilization must be in (0, 1], got {}",
                self.gpu_memory_utilization
            )));
        }
        if self.max_model_len == 0 {
            return Err(InferenceError::Configuration(
                "max_model_len must be positive".to_string(),
            ));
        }
        if let Some(block_size) = self.block_size {
            if !block_size.is_power_of_two() {
                return Err(InferenceError::Configuration(format!(
                    "block_size must be a power of two, got {block_size}"
                )));
            }
        }
        if let Some(batched) = self.max_num_batched_tokens {
            // Without chunked prefill a whole prompt must fit in one batch.
            if !self.enable_chunked_prefill && batched < self.max_model_len {
                return Err(InferenceError::Configuration(format!(
                    "max_num_batched_tokens ({batched}) is smaller than max_model_len ({}) \
                     and chunked prefill is disabled",
                    self.max_model_len
                )));
            }
        }
        if self.max_num_seqs == Some(0) {
            return Err(InferenceError::Configuration(
                "max_num_seqs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-request generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_true")]
    pub skip_special_tokens: bool,

    #[serde(default = "default_true")]
    pub spaces_between_special_tokens: bool,
}

const fn default_temperature() -> f32 {
    0.1
}

const fn default_top_p() -> f32 {
    0.9
}

const fn default_max_tokens() -> usize {
    200
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            skip_special_tokens: true,
            spaces_between_special_tokens: true,
        }
    }
}

impl SamplingParams {
    /// Same parameters with a different generation length limit.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Check the ranges the engine accepts.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Configuration`] for a negative temperature,
    /// `top_p` outside `(0, 1]` or a zero `max_tokens`.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(InferenceError::Configuration(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(InferenceError::Configuration(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_tokens == 0 {
            return Err(InferenceError::Configuration(
                "max_tokens must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults_from_json() {
        let engine: EngineConfig = serde_json::from_str(r#"{"model": "microsoft/Phi-3.5-mini-instruct"}"#).unwrap();
        assert_eq!(engine, EngineConfig::new("microsoft/Phi-3.5-mini-instruct"));
        assert!(engine.validate(&ResourceScope::single(0)).is_ok());
    }

    #[test]
    fn test_tensor_parallel_needs_enough_devices() {
        let engine = EngineConfig {
            tensor_parallel_size: 3,
            ..EngineConfig::new("Qwen/Qwen2.5-72B-Instruct")
        };
        let err = engine.validate(&ResourceScope::single(0)).unwrap_err();
        assert!(matches!(err, InferenceError::Configuration(_)));
        assert!(err.to_string().contains("tensor_parallel_size 3"));

        assert!(engine
            .validate(&ResourceScope::with_devices(0, vec![0, 1, 2]))
            .is_ok());
    }

    #[test]
    fn test_engine_rejects_bad_knobs() {
        let scope = ResourceScope::single(0);
        let base = EngineConfig::new("m");

        let bad = EngineConfig { gpu_memory_utilization: 1.5, ..base.clone() };
        assert!(bad.validate(&scope).is_err());

        let bad = EngineConfig { model: "  ".to_string(), ..base.clone() };
        assert!(bad.validate(&scope).is_err());

        let bad = EngineConfig { block_size: Some(12), ..base.clone() };
        assert!(bad.validate(&scope).is_err());

        let bad = EngineConfig { max_num_batched_tokens: Some(2048), ..base.clone() };
        assert!(bad.validate(&scope).is_err());

        let ok = EngineConfig {
            max_num_batched_tokens: Some(2048),
            enable_chunked_prefill: true,
            ..base
        };
        assert!(ok.validate(&scope).is_ok());
    }

    #[test]
    fn test_sampling_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams { top_p: 0.0, ..Default::default() }.validate().is_err());
        assert!(SamplingParams { temperature: -0.5, ..Default::default() }.validate().is_err());
        assert!(SamplingParams::default().with_max_tokens(0).validate().is_err());
    }
}
