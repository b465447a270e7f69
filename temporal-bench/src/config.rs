//! Bench configuration from environment variables
//!
//! | variable | meaning | default |
//! |----------|---------|---------|
//! | `BENCH_BACKEND` | `http`, `subprocess` or `echo` | `http` |
//! | `BENCH_HTTP_ENDPOINTS` | comma-separated server URLs, one per GPU | `http://127.0.0.1:8000`, `:8001`, ... |
//! | `BENCH_HTTP_API_KEY` | bearer token for the servers | none |
//! | `BENCH_GENERATOR` | generator command line for `subprocess` | required |
//! | `BENCH_NUM_GPUS` | GPUs to fan out over | 3 |
//! | `BENCH_REFERENCE_DATE` | "today" for the prompts, `YYYY-MM-DD` | 2025-08-16 |
//! | `BENCH_LOG_FORMAT` | `json` for JSON logs | text |

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use gpu_bridge::{BackendConfig, EchoConfig, HttpConfig, SubprocessConfig};

pub const BACKEND_ENV: &str = "BENCH_BACKEND";
pub const HTTP_ENDPOINTS_ENV: &str = "BENCH_HTTP_ENDPOINTS";
pub const HTTP_API_KEY_ENV: &str = "BENCH_HTTP_API_KEY";
pub const GENERATOR_ENV: &str = "BENCH_GENERATOR";
pub const NUM_GPUS_ENV: &str = "BENCH_NUM_GPUS";
pub const REFERENCE_DATE_ENV: &str = "BENCH_REFERENCE_DATE";
pub const LOG_FORMAT_ENV: &str = "BENCH_LOG_FORMAT";

const DEFAULT_NUM_GPUS: u32 = 3;
const DEFAULT_HTTP_PORT: u32 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(LOG_FORMAT_ENV).ok().as_deref())
    }

    fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    pub backend: BackendConfig,
    pub num_gpus: u32,
    pub reference_date: NaiveDate,
}

impl BenchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let num_gpus = match get(NUM_GPUS_ENV) {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| anyhow!("{NUM_GPUS_ENV} must be a positive integer, got {raw:?}"))?,
            None => DEFAULT_NUM_GPUS,
        };

        let reference_date = match get(REFERENCE_DATE_ENV) {
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .with_context(|| format!("{REFERENCE_DATE_ENV} must be YYYY-MM-DD, got {raw:?}"))?,
            None => NaiveDate::from_ymd_opt(2025, 8, 16)
                .ok_or_else(|| anyhow!("invalid default reference date"))?,
        };

        let backend = match get(BACKEND_ENV).as_deref().unwrap_or("http") {
            "echo" => BackendConfig::Echo(EchoConfig::default()),
            "http" => {
                let endpoints = match get(HTTP_ENDPOINTS_ENV) {
                    Some(raw) => raw
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    None => (0..num_gpus)
                        .map(|i| format!("http://127.0.0.1:{}", DEFAULT_HTTP_PORT + i))
                        .collect(),
                };
                BackendConfig::Http(HttpConfig {
                    endpoints,
                    api_key: get(HTTP_API_KEY_ENV),
                    request_timeout_secs: None,
                })
            }
            "subprocess" => {
                let raw = get(GENERATOR_ENV)
                    .ok_or_else(|| anyhow!("{GENERATOR_ENV} is required for the subprocess backend"))?;
                let mut parts = raw.split_whitespace().map(str::to_string);
                let program = parts
                    .next()
                    .ok_or_else(|| anyhow!("{GENERATOR_ENV} is empty"))?;
                BackendConfig::Subprocess(SubprocessConfig {
                    program,
                    args: parts.collect(),
                })
            }
            other => bail!("unknown {BACKEND_ENV} {other:?} (expected http, subprocess or echo)"),
        };

        Ok(Self {
            backend,
            num_gpus,
            reference_date,
        })
    }
}
