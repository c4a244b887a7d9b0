use std::time::Duration;

use bulkload_pipeline::{OrchestratorConfig, SubmitPolicy};
use bulkload_remote::reconnect::ChannelPolicy;
use bulkload_sampling::AnalyzerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ingestion service.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the ingestion service.
    pub api_url: String,
    /// Connect timeout for requests to the ingestion service.
    pub request_timeout_secs: u64,
    pub sample_threshold_bytes: u64,
    pub sample_prefix_bytes: u64,
    pub oversize_warn_bytes: u64,
    pub heartbeat_secs: u64,
    pub stall_secs: u64,
    pub import_timeout_secs: u64,
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default                 |
    /// |-----------------------------------|-------------------------|
    /// | `BULKLOAD_API_URL`                | `http://localhost:8000` |
    /// | `BULKLOAD_REQUEST_TIMEOUT_SECS`   | `30`                    |
    /// | `BULKLOAD_SAMPLE_THRESHOLD_BYTES` | `5242880`               |
    /// | `BULKLOAD_SAMPLE_PREFIX_BYTES`    | `512000`                |
    /// | `BULKLOAD_OVERSIZE_WARN_BYTES`    | `524288000`             |
    /// | `BULKLOAD_HEARTBEAT_SECS`         | `10`                    |
    /// | `BULKLOAD_STALL_SECS`             | `30`                    |
    /// | `BULKLOAD_IMPORT_TIMEOUT_SECS`    | `180`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let number = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or(ConfigError::Invalid { var, value }),
            }
        };

        let api_url = lookup("BULKLOAD_API_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| "http://localhost:8000".into());

        Ok(Self {
            api_url,
            request_timeout_secs: number("BULKLOAD_REQUEST_TIMEOUT_SECS", 30)?,
            sample_threshold_bytes: number("BULKLOAD_SAMPLE_THRESHOLD_BYTES", 5 * 1024 * 1024)?,
            sample_prefix_bytes: number("BULKLOAD_SAMPLE_PREFIX_BYTES", 512_000)?,
            oversize_warn_bytes: number("BULKLOAD_OVERSIZE_WARN_BYTES", 500 * 1024 * 1024)?,
            heartbeat_secs: number("BULKLOAD_HEARTBEAT_SECS", 10)?,
            stall_secs: number("BULKLOAD_STALL_SECS", 30)?,
            import_timeout_secs: number("BULKLOAD_IMPORT_TIMEOUT_SECS", 180)?,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            analyzer: AnalyzerConfig {
                sample_threshold_bytes: self.sample_threshold_bytes,
                prefix_bytes: self.sample_prefix_bytes,
            },
            channel: ChannelPolicy {
                heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
                stall_threshold: Duration::from_secs(self.stall_secs),
                absolute_timeout: Duration::from_secs(self.import_timeout_secs),
                ..Default::default()
            },
            submit: SubmitPolicy {
                oversize_warn_bytes: self.oversize_warn_bytes,
            },
        }
    }

    /// Shared HTTP client. Only connecting is bounded: uploads and the
    /// progress stream may legitimately run for minutes.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
    }
}
