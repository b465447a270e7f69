//! Echo backend
//!
//! Returns `prefix + prompt` without touching any hardware. The extra knobs
//! let tests inject failures, slow workers and a device-usage tracker.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fanout_core::{InferenceError, ResourceScope};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Completion, EngineConfig, InferenceService, SamplingParams};
use crate::workers::VISIBLE_DEVICES_ENV;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Resource ids whose generation call fails
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fail_on: Vec<u32>,

    /// Per-resource delay before answering, in milliseconds
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delays_ms: BTreeMap<u32, u64>,

    /// Directory of per-device lock files. When set, every call claims
    /// `device-<id>.lock` for each of its devices and fails on contention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_dir: Option<PathBuf>,
}

fn default_prefix() -> String {
    "echo:".to_string()
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            fail_on: Vec::new(),
            delays_ms: BTreeMap::new(),
            tracker_dir: None,
        }
    }
}

pub struct EchoService {
    config: EchoConfig,
}

impl EchoService {
    pub const fn new(config: EchoConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl InferenceService for EchoService {
    async fn generate(
        &self,
        scope: &ResourceScope,
        engine: &EngineConfig,
        prompts: &[String],
        _sampling: &SamplingParams,
    ) -> Result<Vec<Completion>, InferenceError> {
        let _claims = match &self.config.tracker_dir {
            Some(dir) => Some(DeviceClaims::acquire(dir, scope)?),
            None => None,
        };

        if let Some(ms) = self.config.delays_ms.get(&scope.resource_id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }

        if self.config.fail_on.contains(&scope.resource_id) {
            return Err(InferenceError::Inference(format!(
                "injected failure for resource {} ({})",
                scope.resource_id, engine.model
            )));
        }

        debug!(resource_id = scope.resource_id, prompts = prompts.len(), "Echoing prompts");
        Ok(prompts
            .iter()
            .map(|prompt| Completion {
                prompt: prompt.clone(),
                text: format!("{}{}", self.config.prefix, prompt),
            })
            .collect())
    }
}

/// Exclusive lock files for the devices of one scope, removed on drop.
struct DeviceClaims {
    paths: Vec<PathBuf>,
}

impl DeviceClaims {
    fn acquire(dir: &Path, scope: &ResourceScope) -> Result<Self, InferenceError> {
        // When running inside a worker the process-level visibility must agree with the scope.
        if let Ok(visible) = std::env::var(VISIBLE_DEVICES_ENV) {
            if visible != scope.visible_devices() {
                return Err(InferenceError::ResourceExhaustion(format!(
                    "process sees devices {visible:?} but resource {} owns {:?}",
                    scope.resource_id,
                    scope.visible_devices()
                )));
            }
        }

        let mut claims = Self { paths: Vec::new() };
        for device in &scope.devices {
            let path = dir.join(format!("device-{device}.lock"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => claims.paths.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(InferenceError::ResourceExhaustion(format!(
                        "device {device} is already in use"
                    )));
                }
                Err(e) => {
                    return Err(InferenceError::Inference(format!(
                        "cannot claim device {device}: {e}"
                    )));
                }
            }
        }
        Ok(claims)
    }
}

impl Drop for DeviceClaims {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}
