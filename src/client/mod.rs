//! The ingest client: wires the run builder, auto-batch queue, transport
//! codec, HTTP caller, and server-info probe into one entry point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::context::{self, RunHandle};
use crate::errors::StructuredError;
use crate::http_caller::{HttpCaller, RetryPolicy};
use crate::queue::{AlwaysSample, BatchThresholds, IngestQueue, Operation, RatioSampler, Sampler};
use crate::run::{NewRun, ParentRef, RunBuilder, RunType, RunUpdate};
use crate::server_info::ServerInfoProbe;
use crate::transport;

/// Per-trace sibling counters, so concurrently-created children of the
/// same parent get distinct `execution_order` values for dotted-order
/// tie-breaking.
struct SiblingCounters {
    counters: DashMap<Uuid, AtomicU32>,
}

impl SiblingCounters {
    fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    fn next(&self, parent_id: Option<Uuid>) -> u32 {
        let key = parent_id.unwrap_or(Uuid::nil());
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst)
    }
}

pub struct Client {
    config: ClientConfig,
    queue: Arc<IngestQueue>,
    sampler: Arc<dyn Sampler>,
    siblings: SiblingCounters,
    server_info: Arc<ServerInfoProbe>,
    http_caller: Arc<HttpCaller>,
    /// Tracks which root traces were sampled out, so a late patch against
    /// an unsampled run is dropped instead of queued (§4.C sampling note).
    sampled_traces: DashMap<Uuid, bool>,
    /// When set, a patch that sets `end_time` on a root run (its own trace
    /// root) forces an immediate drain of whatever is queued, rather than
    /// waiting for a count/byte threshold or an explicit `flush` call.
    block_on_root: bool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_options(config, 1.0, false, false)
    }

    pub fn with_sample_rate(config: ClientConfig, sample_rate: f64) -> Self {
        Self::with_options(config, sample_rate, false, false)
    }

    /// `manual_flush_mode` disables automatic flushing on threshold trip;
    /// the caller must call [`Client::flush`] explicitly. `block_on_root`
    /// forces an immediate drain whenever a root run's own finalizing patch
    /// (one that sets `end_time`) is enqueued, independent of
    /// `manual_flush_mode`.
    pub fn with_options(
        config: ClientConfig,
        sample_rate: f64,
        manual_flush_mode: bool,
        block_on_root: bool,
    ) -> Self {
        let http_client = reqwest::Client::new();
        let http_caller = Arc::new(HttpCaller::new(RetryPolicy::default(), 10));
        let server_info = Arc::new(ServerInfoProbe::new(http_client.clone(), config.endpoint.clone()));

        let sender_config = config.clone();
        let sender_caller = Arc::clone(&http_caller);
        let sender_server_info = Arc::clone(&server_info);
        let sender_http_client = http_client;

        let sender: crate::queue::Sender = Arc::new(move |ops: Vec<Operation>| {
            let config = sender_config.clone();
            let caller = Arc::clone(&sender_caller);
            let server_info = Arc::clone(&sender_server_info);
            let http_client = sender_http_client.clone();
            Box::pin(async move { dispatch_batch(&config, &caller, &server_info, &http_client, ops).await })
        });

        let thresholds = BatchThresholds {
            max_batch_size: config.batch_size_count_limit,
            max_batch_bytes: config.batch_size_bytes_limit,
        };
        let queue = Arc::new(
            IngestQueue::new(thresholds, 10, sender).with_manual_flush_mode(manual_flush_mode),
        );

        let sampler: Arc<dyn Sampler> = if sample_rate >= 1.0 {
            Arc::new(AlwaysSample)
        } else {
            Arc::new(RatioSampler { ratio: sample_rate })
        };

        Self {
            config,
            queue,
            sampler,
            siblings: SiblingCounters::new(),
            server_info,
            http_caller,
            sampled_traces: DashMap::new(),
            block_on_root,
        }
    }

    /// Creates and enqueues a new run. `parent` wins over the ambient
    /// task-local context; if neither is present the run is a trace root.
    pub async fn create_run(
        &self,
        name: impl Into<String>,
        run_type: RunType,
        inputs: Value,
        parent: Option<&RunHandle>,
    ) -> RunHandle {
        let resolved_parent = context::resolve_parent(parent.cloned());
        let parent_ref = resolved_parent.as_ref().map(|h| ParentRef {
            trace_id: h.trace_id,
            dotted_order: h.dotted_order.clone(),
        });

        let execution_order = self.siblings.next(resolved_parent.as_ref().map(|h| h.id));

        let run = RunBuilder::build(
            NewRun {
                name: name.into(),
                run_type,
                inputs,
                session_name: self.config.project.clone(),
                tags: Vec::new(),
                extra: HashMap::new(),
                id: None,
                start_time: None,
            },
            parent_ref.as_ref(),
            execution_order,
        );

        let sampled = resolved_parent
            .as_ref()
            .map(|h| h.sampled)
            .unwrap_or_else(|| self.sampler.should_sample());
        self.sampled_traces.insert(run.trace_id, sampled);

        let handle = RunHandle {
            id: run.id,
            trace_id: run.trace_id,
            dotted_order: run.dotted_order.clone(),
            sampled,
        };

        if sampled {
            self.queue.enqueue_post(run).await;
        }

        handle
    }

    /// Queues an update against an existing run. Dropped silently if the
    /// run's trace was sampled out at creation. If `block_on_root` is set
    /// and this update finalizes a root run (its own trace id), the queue
    /// is drained immediately instead of waiting for a threshold.
    pub async fn update_run(&self, handle: &RunHandle, update: RunUpdate) {
        if !handle.sampled {
            return;
        }
        let is_root_finalization =
            self.block_on_root && update.end_time.is_some() && handle.trace_id == handle.id;
        self.queue.enqueue_patch(update).await;
        if is_root_finalization {
            self.queue.flush().await;
        }
    }

    /// Runs `fut` with `handle` as the ambient current run.
    pub async fn with_current_run<F, T>(&self, handle: RunHandle, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        context::with_current_run(handle, fut).await
    }

    /// Forces an immediate flush of whatever is queued, without waiting
    /// for dispatched batches to settle.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Blocks until every dispatched batch has settled.
    pub async fn await_pending_batches(&self) -> Result<(), StructuredError> {
        self.queue.await_pending_batches().await
    }

    /// Flushes and waits for completion; the client remains usable
    /// afterward (this does not tear down the HTTP client).
    pub async fn shutdown(&self) -> Result<(), StructuredError> {
        self.await_pending_batches().await
    }

    pub fn is_session_disabled(&self) -> bool {
        self.http_caller.is_session_disabled()
    }
}

async fn dispatch_batch(
    config: &ClientConfig,
    caller: &HttpCaller,
    server_info: &ServerInfoProbe,
    http_client: &reqwest::Client,
    ops: Vec<Operation>,
) -> Result<(), StructuredError> {
    let info = server_info.get().await;
    let gzip = info.instance_flags.supports_gzip;
    let use_multipart = info.batch_ingest_config.use_multipart_endpoint;

    let api_key = config.api_key.clone().unwrap_or_default();
    let url = config
        .endpoint
        .join(if use_multipart { "runs/multipart" } else { "runs/batch" })
        .map_err(|e| {
            StructuredError::new(crate::errors::ErrorCode::INVALID_ENDPOINT_URL, e.to_string())
        })?;

    if use_multipart {
        caller
            .send_with_retry(|| {
                // reqwest::multipart::Form isn't Clone, so each retry attempt
                // re-encodes the batch into a fresh form rather than reusing one.
                let form = transport::encode_multipart_batch(&ops, gzip)?;
                Ok(http_client
                    .post(url.clone())
                    .header("x-api-key", &api_key)
                    .header("Langsmith-Project", &config.project)
                    .header(reqwest::header::USER_AGENT, transport::USER_AGENT)
                    .multipart(form))
            })
            .await
    } else {
        let encoded = transport::encode_json_batch(&ops, gzip)?;
        caller
            .send_with_retry(|| {
                let mut req = http_client
                    .post(url.clone())
                    .header("x-api-key", &api_key)
                    .header("Langsmith-Project", &config.project)
                    .header(reqwest::header::USER_AGENT, transport::USER_AGENT)
                    .header(reqwest::header::CONTENT_TYPE, &encoded.content_type)
                    .body(encoded.body.clone());
                if let Some(encoding) = encoded.content_encoding {
                    req = req.header(reqwest::header::CONTENT_ENCODING, encoding);
                }
                Ok(req)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: &str) -> ClientConfig {
        ClientConfig {
            endpoint: url::Url::parse(endpoint).unwrap(),
            api_key: Some("test-key".to_string()),
            project: "default".to_string(),
            tracing_enabled: true,
            batch_size_bytes_limit: 1024 * 1024,
            batch_size_count_limit: 2,
        }
    }

    #[tokio::test]
    async fn create_run_without_parent_is_trace_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/info")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let client = Client::new(test_config(&server.uri()));
        let handle = client.create_run("root", RunType::Chain, json!({}), None).await;
        assert_eq!(handle.id, handle.trace_id);
        assert!(handle.sampled);
    }

    #[tokio::test]
    async fn child_run_inherits_parent_trace() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/info")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let client = Client::new(test_config(&server.uri()));
        let root = client.create_run("root", RunType::Chain, json!({}), None).await;
        let child = client.create_run("child", RunType::Tool, json!({}), Some(&root)).await;
        assert_eq!(child.trace_id, root.trace_id);
    }

    #[tokio::test]
    async fn flush_dispatches_queued_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/info")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(1).mount(&server).await;

        let client = Client::new(test_config(&server.uri()));
        client.create_run("r", RunType::Llm, json!({}), None).await;
        client.await_pending_batches().await.unwrap();
    }

    #[tokio::test]
    async fn unsampled_trace_drops_update() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/info")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        let client = Client::with_sample_rate(test_config(&server.uri()), 0.0);
        let handle = client.create_run("r", RunType::Llm, json!({}), None).await;
        assert!(!handle.sampled);
        client
            .update_run(&handle, RunUpdate { id: handle.id, ..Default::default() })
            .await;
        assert_eq!(client.queue.queued_len().await, 0);
    }

    #[tokio::test]
    async fn block_on_root_end_time_triggers_immediate_drain() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/info")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        // manual_flush_mode on, so nothing drains except via the root-finalization trigger.
        let client = Client::with_options(test_config(&server.uri()), 1.0, true, true);
        let root = client.create_run("root", RunType::Chain, json!({}), None).await;
        assert_eq!(client.queue.queued_len().await, 1);

        client
            .update_run(
                &root,
                RunUpdate { id: root.id, end_time: Some(1), ..Default::default() },
            )
            .await;

        assert_eq!(client.queue.queued_len().await, 0);
    }

    #[tokio::test]
    async fn non_root_end_time_does_not_trigger_drain_without_block_on_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/info")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let client = Client::with_options(test_config(&server.uri()), 1.0, true, false);
        let root = client.create_run("root", RunType::Chain, json!({}), None).await;
        client
            .update_run(
                &root,
                RunUpdate { id: root.id, end_time: Some(1), ..Default::default() },
            )
            .await;

        // block_on_root is off, manual_flush_mode is on: nothing drains yet.
        assert_eq!(client.queue.queued_len().await, 1);
    }
}
