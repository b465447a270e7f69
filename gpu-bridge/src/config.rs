//! Harness configuration
//!
//! Read from the environment the same way the drivers are configured:
//!
//! | variable | meaning | default |
//! |----------|---------|---------|
//! | `FANOUT_JOIN_TIMEOUT_SECS` | per-worker deadline before the worker is killed | unset: wait forever |
//! | `FANOUT_MAX_FRAME_BYTES` | largest IPC frame accepted from a worker | 16 MiB |

use std::time::Duration;

use thiserror::Error;

use crate::workers::ipc::DEFAULT_MAX_FRAME_BYTES;

pub const JOIN_TIMEOUT_ENV: &str = "FANOUT_JOIN_TIMEOUT_SECS";
pub const MAX_FRAME_BYTES_ENV: &str = "FANOUT_MAX_FRAME_BYTES";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for one [`Harness`](crate::Harness).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Bounded join per worker; `None` keeps the original wait-forever behaviour.
    pub join_timeout: Option<Duration>,

    /// Largest frame accepted from a worker
    pub max_frame_bytes: usize,

    /// Devices owned by each resource slot (`device_groups[resource_id]`).
    /// `None` binds slot `i` to device `i`.
    pub device_groups: Option<Vec<Vec<u32>>>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            join_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            device_groups: None,
        }
    }
}

impl HarnessConfig {
    /// Creates a HarnessConfig from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates a HarnessConfig from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(JOIN_TIMEOUT_ENV).filter(|v| !v.trim().is_empty()) {
            let secs: f64 = raw.trim().parse().map_err(|e: std::num::ParseFloatError| {
                ConfigError::Invalid {
                    key: JOIN_TIMEOUT_ENV,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::Invalid {
                    key: JOIN_TIMEOUT_ENV,
                    value: raw,
                    reason: "must be a positive number of seconds".to_string(),
                });
            }
            let timeout =
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
                    key: JOIN_TIMEOUT_ENV,
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
            config.join_timeout = Some(timeout);
        }

        if let Some(raw) = lookup(MAX_FRAME_BYTES_ENV).filter(|v| !v.trim().is_empty()) {
            config.max_frame_bytes = raw
                .trim()
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    key: MAX_FRAME_BYTES_ENV,
                    value: raw.clone(),
                    reason: "must be a positive integer".to_string(),
                })?;
        }

        Ok(config)
    }

    /// Kill any worker still running `timeout` after it was spawned.
    pub const fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = Some(timeout);
        self
    }

    /// Bind resource slot `i` to `groups[i]`; a slot without a group cannot be dispatched.
    pub fn with_device_groups(mut self, groups: Vec<Vec<u32>>) -> Self {
        self.device_groups = Some(groups);
        self
    }

    /// Devices bound to a resource slot, if the slot is mapped.
    pub fn devices_for(&self, resource_id: u32) -> Option<Vec<u32>> {
        match &self.device_groups {
            None => Some(vec![resource_id]),
            Some(groups) => groups.get(resource_id as usize).cloned(),
        }
    }
}
