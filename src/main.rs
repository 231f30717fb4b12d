//! CLI front-end for the trace-ingest client: manual testing and CI smoke
//! checks against a configured endpoint, without writing application code.
//!
//! ```bash
//! client run --endpoint https://api.smith.langchain.com --api-key $KEY
//! client info --endpoint https://api.smith.langchain.com
//! client prompts get --key my-prompt --cache-dir ./cache
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use langtrace_client::client::Client;
use langtrace_client::config::{ClientConfig, ConfigOverrides};
use langtrace_client::prompt_cache::{PromptCache, PromptCacheConfig};
use langtrace_client::run::RunType;
use langtrace_client::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Trace-ingest client CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds a small demo run tree and drains it against a configured endpoint.
    Run {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value = "1.0")]
        sample_rate: f64,
        #[arg(long, default_value = "false")]
        manual_flush: bool,
        #[arg(long, default_value = "false")]
        block_on_root: bool,
    },
    /// Runs the server-info probe and prints the resolved capabilities.
    Info {
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Prompt-cache operations against a locally-instantiated cache.
    Prompts {
        #[command(subcommand)]
        action: PromptsAction,
    },
}

#[derive(Subcommand)]
enum PromptsAction {
    /// Looks up a key, reporting hit/miss and resulting metrics.
    Get {
        #[arg(long)]
        key: String,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Persists the current cache contents to a file.
    Dump {
        #[arg(long)]
        path: PathBuf,
    },
    /// Loads previously dumped cache contents from a file.
    Load {
        #[arg(long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry_config = TelemetryConfig::from_env();
    let tracer = init_telemetry(telemetry_config)?;

    let cli = Cli::parse();
    let result = run(cli).await;

    if let Err(err) = &result {
        error!(error = %err, "command failed");
    }
    if tracer.is_some() {
        shutdown_telemetry();
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            endpoint,
            api_key,
            project,
            sample_rate,
            manual_flush,
            block_on_root,
        } => run_demo_trace(endpoint, api_key, project, sample_rate, manual_flush, block_on_root).await,
        Commands::Info { endpoint } => run_info(endpoint).await,
        Commands::Prompts { action } => run_prompts(action).await,
    }
}

async fn run_demo_trace(
    endpoint: Option<String>,
    api_key: Option<String>,
    project: Option<String>,
    sample_rate: f64,
    manual_flush: bool,
    block_on_root: bool,
) -> anyhow::Result<()> {
    let config = ClientConfig::from_env(ConfigOverrides {
        endpoint,
        api_key,
        project,
    })?;

    let client = Client::with_options(config, sample_rate, manual_flush, block_on_root);

    let root = client
        .create_run("demo-trace", RunType::Chain, json!({"prompt": "hello"}), None)
        .await;

    let child = client
        .create_run("demo-tool-call", RunType::Tool, json!({"arg": 1}), Some(&root))
        .await;

    client
        .update_run(
            &child,
            langtrace_client::RunUpdate {
                id: child.id,
                outputs: Some(json!({"result": "ok"})),
                end_time: Some(chrono::Utc::now().timestamp_millis()),
                ..Default::default()
            },
        )
        .await;

    if block_on_root {
        client
            .update_run(
                &root,
                langtrace_client::RunUpdate {
                    id: root.id,
                    outputs: Some(json!({"final": "done"})),
                    end_time: Some(chrono::Utc::now().timestamp_millis()),
                    ..Default::default()
                },
            )
            .await;
    }

    client.flush().await;
    client.await_pending_batches().await?;

    info!(trace_id = %root.trace_id, "demo trace drained");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "trace_id": root.trace_id,
            "root_run_id": root.id,
            "child_run_id": child.id,
            "session_disabled": client.is_session_disabled(),
        }))?
    );
    Ok(())
}

async fn run_info(endpoint: Option<String>) -> anyhow::Result<()> {
    let config = ClientConfig::from_env(ConfigOverrides {
        endpoint,
        ..Default::default()
    })?;
    let probe = langtrace_client::server_info::ServerInfoProbe::new(reqwest::Client::new(), config.endpoint);
    let info = probe.get().await;
    println!("{}", serde_json::to_string_pretty(&json!({
        "version": info.version,
        "batch_ingest_config": {
            "use_multipart_endpoint": info.batch_ingest_config.use_multipart_endpoint,
            "size_limit_bytes": info.batch_ingest_config.size_limit_bytes,
        },
        "instance_flags": {
            "supports_gzip": info.instance_flags.supports_gzip,
        },
    }))?);
    Ok(())
}

async fn run_prompts(action: PromptsAction) -> anyhow::Result<()> {
    match action {
        PromptsAction::Get { key, cache_dir } => {
            let cache = PromptCache::new(PromptCacheConfig::default());
            if let Some(dir) = &cache_dir {
                // load() tolerates a missing file, so no need to check existence first.
                cache.load(&dir.join("prompt_cache.json")).await?;
            }

            let hit = cache.get(&key).await;
            let (hits, misses, refreshes, refresh_errors) = cache.metrics();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "key": key,
                    "hit": hit.is_some(),
                    "value": hit,
                    "metrics": {
                        "hits": hits,
                        "misses": misses,
                        "refreshes": refreshes,
                        "refresh_errors": refresh_errors,
                    }
                }))?
            );
            Ok(())
        }
        PromptsAction::Dump { path } => {
            let cache = PromptCache::new(PromptCacheConfig::default());
            cache.dump(&path).await?;
            println!("dumped cache to {}", path.display());
            Ok(())
        }
        PromptsAction::Load { path } => {
            let cache = PromptCache::new(PromptCacheConfig::default());
            let loaded = cache.load(&path).await?;
            let (hits, misses, _, _) = cache.metrics();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "loaded_from": path,
                    "loaded": loaded,
                    "hits": hits,
                    "misses": misses,
                }))?
            );
            Ok(())
        }
    }
}
