//! Trace-ingest client: ships hierarchical LLM/agent execution traces
//! ("runs") to a remote observability backend.
//!
//! Application code creates a root run with [`client::Client::create_run`],
//! attaches children either explicitly or via the ambient tracer context
//! in [`context`], and updates runs with outputs/errors as they complete.
//! Everything in between — ordering, batching, retrying, and wire
//! encoding — is handled internally.

pub mod client;
pub mod config;
pub mod context;
pub mod dotted_order;
pub mod errors;
pub mod http_caller;
pub mod prompt_cache;
pub mod queue;
pub mod reparent;
pub mod run;
pub mod server_info;
pub mod telemetry;
pub mod transport;

pub use client::Client;
pub use context::RunHandle;
pub use errors::{ErrorCode, StructuredError};
pub use run::{RunType, RunUpdate};
