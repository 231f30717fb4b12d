//! Server capability probe (`GET /info`).
//!
//! The result tells the transport layer whether the backend accepts the
//! multipart ingest format and what batch limits it advertises; it's
//! cached process-wide for a short TTL so every flush doesn't re-probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::errors::StructuredError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BatchIngestConfig {
    #[serde(default)]
    pub use_multipart_endpoint: bool,
    #[serde(default)]
    pub size_limit_bytes: Option<u64>,
    #[serde(default)]
    pub size_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InstanceFlags {
    #[serde(default)]
    pub supports_gzip: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub batch_ingest_config: BatchIngestConfig,
    #[serde(default)]
    pub instance_flags: InstanceFlags,
}

impl ServerInfo {
    /// The conservative fallback used when the probe itself fails: classic
    /// JSON batch ingest, no gzip, no advertised size limit.
    fn fallback() -> Self {
        Self::default()
    }
}

struct CachedProbe {
    info: ServerInfo,
    fetched_at: Instant,
}

/// Probes and caches `GET /info` with a TTL, so repeated flushes share one
/// outcome instead of re-querying the backend every time.
pub struct ServerInfoProbe {
    client: reqwest::Client,
    base_url: url::Url,
    ttl: Duration,
    cached: Arc<RwLock<Option<CachedProbe>>>,
}

impl ServerInfoProbe {
    pub fn new(client: reqwest::Client, base_url: url::Url) -> Self {
        Self {
            client,
            base_url,
            ttl: Duration::from_secs(300),
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the cached probe result if still fresh, otherwise re-probes.
    /// A probe failure never propagates: callers get the conservative
    /// fallback and transport proceeds with classic JSON batching.
    pub async fn get(&self) -> ServerInfo {
        if let Some(info) = self.fresh_cached().await {
            return info;
        }

        let info = match self.fetch().await {
            Ok(info) => info,
            Err(_) => ServerInfo::fallback(),
        };

        let mut guard = self.cached.write().await;
        *guard = Some(CachedProbe {
            info: info.clone(),
            fetched_at: Instant::now(),
        });
        info
    }

    async fn fresh_cached(&self) -> Option<ServerInfo> {
        let guard = self.cached.read().await;
        guard.as_ref().and_then(|cached| {
            if cached.fetched_at.elapsed() < self.ttl {
                Some(cached.info.clone())
            } else {
                None
            }
        })
    }

    async fn fetch(&self) -> Result<ServerInfo, StructuredError> {
        let url = self
            .base_url
            .join("info")
            .map_err(|e| StructuredError::new(crate::errors::ErrorCode::INVALID_ENDPOINT_URL, e.to_string()))?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StructuredError::new(crate::errors::ErrorCode::HTTP_CONNECTION_ERROR, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(StructuredError::new(
                crate::errors::ErrorCode::HTTP_UNEXPECTED_STATUS,
                format!("info probe returned {}", resp.status()),
            ));
        }

        resp.json::<ServerInfo>()
            .await
            .map_err(|e| StructuredError::new(crate::errors::ErrorCode::SERIALIZATION_BUG, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_caches_result_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": "1.2.3",
                "batch_ingest_config": {"use_multipart_endpoint": true},
                "instance_flags": {"supports_gzip": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let base = url::Url::parse(&format!("{}/", server.uri())).unwrap();
        let probe = ServerInfoProbe::new(reqwest::Client::new(), base).with_ttl(Duration::from_secs(60));

        let first = probe.get().await;
        let second = probe.get().await;
        assert!(first.batch_ingest_config.use_multipart_endpoint);
        assert!(second.batch_ingest_config.use_multipart_endpoint);
    }

    #[tokio::test]
    async fn probe_failure_falls_back_to_classic_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let base = url::Url::parse(&format!("{}/", server.uri())).unwrap();
        let probe = ServerInfoProbe::new(reqwest::Client::new(), base);

        let info = probe.get().await;
        assert!(!info.batch_ingest_config.use_multipart_endpoint);
        assert!(!info.instance_flags.supports_gzip);
    }
}
