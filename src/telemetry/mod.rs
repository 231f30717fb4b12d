//! Telemetry: internal client logging, with an optional OTLP layer for
//! observing the client's own behavior (request latency, retries, queue
//! depth). This is distinct from the trace *data* the client ingests on
//! behalf of applications — that data is application telemetry flowing
//! to the ingest backend, not the client's own operational traces.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the client's own logging/tracing, separate from
/// [`crate::config::ClientConfig`] which governs ingest behavior.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP collector endpoint for the client's own spans. `None` means
    /// console logging only.
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    pub log_level: Level,
    /// Log full request/response bodies at DEBUG level. Off by default
    /// since run payloads routinely carry user content.
    pub log_batch_bodies: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "langtrace-client".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
            log_batch_bodies: false,
        }
    }
}

impl TelemetryConfig {
    /// Builds configuration from `OTEL_*` environment variables, the
    /// conventional knobs for this family of tools.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }
        if let Ok(flag) = std::env::var("LANGTRACE_LOG_BATCH_BODIES") {
            config.log_batch_bodies = matches!(flag.as_str(), "1" | "true" | "TRUE");
        }

        config
    }
}

/// Initializes logging (and, if `otlp_endpoint` is set, an OTLP span
/// layer) for the client's own operation. Returns the tracer when OTLP
/// was configured, so callers can flush it on shutdown.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());
        let subscriber = tracing_subscriber::registry().with(env_filter).with(telemetry_layer);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "telemetry initialized with OTLP export"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!("telemetry initialized (console only, no OTLP)");
        Ok(None)
    }
}

fn init_otlp_tracer(service_name: &str, endpoint: &str, sampling_ratio: f64) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);
    Ok(tracer)
}

/// Flushes and shuts down the OTLP exporter, if one was started. Must be
/// called before process exit or pending spans are dropped.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
    tracing::info!("telemetry shut down");
}

/// Instrumentation helpers for wrapping an outbound batch request with
/// span attributes.
pub mod instrumentation {
    use std::time::Instant;

    #[derive(Debug)]
    pub struct BatchSpanContext {
        pub method: String,
        pub path: String,
        pub start_time: Instant,
        pub status_code: Option<u16>,
        pub duration_ms: Option<u64>,
        pub op_count: usize,
    }

    impl BatchSpanContext {
        pub fn new(method: &str, path: &str, op_count: usize) -> Self {
            Self {
                method: method.to_string(),
                path: path.to_string(),
                start_time: Instant::now(),
                status_code: None,
                duration_ms: None,
                op_count,
            }
        }

        pub fn finish(&mut self, status_code: u16) {
            self.status_code = Some(status_code);
            self.duration_ms = Some(self.start_time.elapsed().as_millis() as u64);
        }

        pub fn attributes(&self) -> Vec<(&'static str, String)> {
            let mut attrs = vec![
                ("http.method", self.method.clone()),
                ("http.target", self.path.clone()),
                ("batch.op_count", self.op_count.to_string()),
            ];
            if let Some(status) = self.status_code {
                attrs.push(("http.status_code", status.to_string()));
            }
            if let Some(duration) = self.duration_ms {
                attrs.push(("http.duration_ms", duration.to_string()));
            }
            attrs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_otlp_and_hides_bodies() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "langtrace-client");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(!config.log_batch_bodies);
    }

    #[test]
    fn batch_span_context_records_status_and_duration() {
        use instrumentation::BatchSpanContext;

        let mut ctx = BatchSpanContext::new("POST", "/runs/batch", 3);
        assert!(ctx.status_code.is_none());
        ctx.finish(202);

        assert_eq!(ctx.status_code, Some(202));
        assert!(ctx.duration_ms.is_some());
        assert!(ctx
            .attributes()
            .iter()
            .any(|(k, v)| *k == "batch.op_count" && v == "3"));
    }
}
