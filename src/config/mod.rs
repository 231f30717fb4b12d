//! Client configuration: environment first, CLI overrides win, mirroring
//! the precedence `TelemetryConfig::from_env()` establishes for the
//! client's own logging.

use url::Url;

use crate::errors::{ErrorCode, StructuredError};

const DEFAULT_ENDPOINT: &str = "https://api.smith.langchain.com";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub project: String,
    pub tracing_enabled: bool,
    pub batch_size_bytes_limit: usize,
    pub batch_size_count_limit: usize,
}

/// CLI-supplied overrides; any field left `None` falls through to the
/// environment-derived value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub project: Option<String>,
}

impl ClientConfig {
    /// Reads `LANGSMITH_*`/`LANGCHAIN_*` environment variables, with the
    /// `LANGSMITH_*` name winning when both are set, then applies `overrides`.
    pub fn from_env(overrides: ConfigOverrides) -> Result<Self, StructuredError> {
        let endpoint_raw = overrides
            .endpoint
            .or_else(|| env_pair("LANGSMITH_ENDPOINT", "LANGCHAIN_ENDPOINT"))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let endpoint = Url::parse(&endpoint_raw).map_err(|e| {
            StructuredError::new(ErrorCode::INVALID_ENDPOINT_URL, format!("{endpoint_raw}: {e}"))
        })?;

        let api_key = overrides.api_key.or_else(|| env_pair("LANGSMITH_API_KEY", "LANGCHAIN_API_KEY"));

        let project = overrides
            .project
            .or_else(|| env_pair("LANGSMITH_PROJECT", "LANGCHAIN_PROJECT"))
            .unwrap_or_else(|| "default".to_string());

        let tracing_enabled = env_pair("LANGSMITH_TRACING", "LANGCHAIN_TRACING_V2")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
            .unwrap_or(true);

        Ok(Self {
            endpoint,
            api_key,
            project,
            tracing_enabled,
            // Defaults pending a live /info probe; the server_info module
            // may override these once the backend's real limits are known.
            batch_size_bytes_limit: 20 * 1024 * 1024,
            batch_size_count_limit: 100,
        })
    }

    pub fn require_api_key(&self) -> Result<&str, StructuredError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| StructuredError::new(ErrorCode::MISSING_API_KEY, "no API key configured"))
    }
}

/// Reads `primary`, falling back to `secondary` only if `primary` is unset.
fn env_pair(primary: &str, secondary: &str) -> Option<String> {
    std::env::var(primary).ok().or_else(|| std::env::var(secondary).ok())
}
