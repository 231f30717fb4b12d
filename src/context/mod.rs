//! Ambient tracer context.
//!
//! Carries the currently-active run through a call tree without explicit
//! parameter threading, the same way the retry executor's ambient state
//! is scoped to one execution. Call sites that do have a parent on hand
//! can still pass it explicitly; the task-local is only consulted as a
//! fallback.

use uuid::Uuid;

use crate::errors::{ErrorCode, StructuredError};

pub const TRACE_HEADER: &str = "langsmith-trace";
pub const BAGGAGE_HEADER: &str = "baggage";

/// The in-process handle to a run, carried through ambient context or
/// returned directly from `create_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub dotted_order: String,
    pub sampled: bool,
}

tokio::task_local! {
    static CURRENT_RUN: RunHandle;
}

/// Runs `fut` with `handle` installed as the ambient current run for its
/// duration. Nested calls to [`current`] inside `fut` observe `handle`.
pub async fn with_current_run<F, T>(handle: RunHandle, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_RUN.scope(handle, fut).await
}

/// The ambient current run, if any is installed on this task.
pub fn current() -> Option<RunHandle> {
    CURRENT_RUN.try_with(|h| h.clone()).ok()
}

/// Resolves the effective parent for a new run: an explicitly-passed
/// parent wins, otherwise fall back to the ambient current run.
pub fn resolve_parent(explicit: Option<RunHandle>) -> Option<RunHandle> {
    explicit.or_else(current)
}

/// Encodes a run handle into the outbound propagation headers used to
/// carry trace context across process boundaries.
pub fn to_headers(handle: &RunHandle) -> Vec<(&'static str, String)> {
    let baggage = format!(
        "langsmith-sampled={},langsmith-trace-id={}",
        handle.sampled, handle.trace_id
    );
    vec![
        (TRACE_HEADER, handle.dotted_order.clone()),
        (BAGGAGE_HEADER, urlencoding::encode(&baggage).into_owned()),
    ]
}

/// Reconstructs a run handle's identity from propagation headers received
/// on an inbound request. `sampled` defaults to `true` if the baggage
/// header is absent or malformed, matching the conservative default of
/// "trace unless told not to."
pub fn from_headers(trace_header: &str, baggage_header: Option<&str>) -> Result<RunHandle, StructuredError> {
    let parsed = crate::dotted_order::parse(trace_header).map_err(|e| {
        StructuredError::new(ErrorCode::CONTEXT_MISSING, format!("bad {TRACE_HEADER} header: {e}"))
    })?;

    let sampled = baggage_header
        .and_then(|raw| urlencoding::decode(raw).ok())
        .map(|decoded| decoded.contains("langsmith-sampled=true"))
        .unwrap_or(true);

    Ok(RunHandle {
        id: parsed.id,
        trace_id: parsed.trace_id,
        dotted_order: trace_header.to_string(),
        sampled,
    })
}
