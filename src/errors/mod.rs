//! Structured error codes for the ingest client.
//!
//! Mirrors the `E{category}{NNN}` banding scheme used elsewhere in this
//! family of tools, repurposed here for trace ingest rather than test
//! execution:
//!
//! | Band  | Category          |
//! |-------|-------------------|
//! | E1xxx | Validation/schema |
//! | E2xxx | Transport         |
//! | E3xxx | Batch/queue       |
//! | E4xxx | Configuration     |
//! | E5xxx | Internal          |

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: validation/schema
    pub const INVALID_RUN_TYPE: Self = Self(1001);
    pub const MISSING_START_TIME: Self = Self(1002);
    pub const MALFORMED_DOTTED_ORDER: Self = Self(1003);
    pub const END_BEFORE_START: Self = Self(1004);

    // E2xxx: transport
    pub const HTTP_TIMEOUT: Self = Self(2001);
    pub const HTTP_CONNECTION_ERROR: Self = Self(2002);
    pub const HTTP_UNEXPECTED_STATUS: Self = Self(2003);
    pub const GZIP_ENCODE_FAILURE: Self = Self(2004);
    pub const MULTIPART_BUILD_FAILURE: Self = Self(2005);

    // E3xxx: batch/queue
    pub const QUEUE_OVERFLOW: Self = Self(3001);
    pub const DRAIN_FAILED: Self = Self(3002);
    pub const SAMPLING_MISCONFIGURED: Self = Self(3003);

    // E4xxx: configuration
    pub const MISSING_API_KEY: Self = Self(4001);
    pub const INVALID_ENDPOINT_URL: Self = Self(4002);
    pub const CACHE_PATH_UNWRITABLE: Self = Self(4003);

    // E5xxx: internal
    pub const INTERNAL_INVARIANT_VIOLATED: Self = Self(5001);
    pub const SERIALIZATION_BUG: Self = Self(5002);
    pub const CONTEXT_MISSING: Self = Self(5003);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Validation,
            2 => ErrorCategory::Transport,
            3 => ErrorCategory::Queue,
            4 => ErrorCategory::Configuration,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Transport,
    Queue,
    Configuration,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Transport => write!(f, "transport"),
            Self::Queue => write!(f, "queue"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Extra context attached to a [`StructuredError`].
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub run_id: Option<String>,
    pub batch_id: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// A code-carrying error, raised by any ingest subsystem.
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<ErrorContext>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        let ctx = self.context.get_or_insert_with(ErrorContext::default);
        ctx.run_id = Some(run_id.into());
        self
    }
}

/// Transport-layer errors, distinguishing retryable from terminal failures
/// per the HTTP caller's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transient network or timeout error: {0}")]
    TransientNetwork(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("validation rejected by server (422): {body}")]
    ValidationRejected { body: String },

    #[error("unauthorized (401/403), further sends disabled for this session")]
    Unauthorized,

    #[error("server error {status}")]
    ServerError5xx { status: u16 },

    #[error("exhausted {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Prompt-cache errors. Refresh failures are counted, never propagated to
/// `get`/`set` callers; these are surfaced only from `dump`/`load`.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to serialize cache dump: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write cache dump to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<CacheError> for StructuredError {
    fn from(err: CacheError) -> Self {
        let code = match &err {
            CacheError::Serialize(_) => ErrorCode::SERIALIZATION_BUG,
            CacheError::Write { .. } => ErrorCode::CACHE_PATH_UNWRITABLE,
        };
        StructuredError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_category_band() {
        assert_eq!(ErrorCode::INVALID_RUN_TYPE.formatted(), "E1001");
        assert_eq!(ErrorCode::HTTP_TIMEOUT.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::QUEUE_OVERFLOW.category(), ErrorCategory::Queue);
    }

    #[test]
    fn structured_error_carries_context() {
        let err = StructuredError::new(ErrorCode::MALFORMED_DOTTED_ORDER, "bad segment")
            .with_run_id("abc-123");
        assert!(err.to_string().contains("E1003"));
        assert_eq!(err.context.unwrap().run_id.unwrap(), "abc-123");
    }
}
