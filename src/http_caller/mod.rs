//! HTTP caller: retry policy and concurrency bound for outbound batch
//! requests.
//!
//! Generalizes the closure-based retry executor pattern to transport
//! calls: transient statuses and network errors back off with
//! decorrelated jitter, a `Retry-After` header is honored verbatim when
//! present, and terminal outcomes (422, 401/403) short-circuit instead of
//! burning the attempt budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use std::sync::Arc;

use crate::errors::{ErrorCode, StructuredError};

const TRANSIENT_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// What to do after one attempt.
enum AttemptOutcome {
    Success,
    RetryAfter(Duration),
    Terminal(StructuredError),
}

/// Retries requests built by the caller; does not itself own the HTTP
/// client, since `build_request` closures already capture one. Tracks
/// whether a 401/403 has disabled the session — further sends then
/// short-circuit without attempting the network call at all.
pub struct HttpCaller {
    policy: RetryPolicy,
    dispatch_limit: Arc<Semaphore>,
    session_disabled: AtomicBool,
}

impl HttpCaller {
    pub fn new(policy: RetryPolicy, max_in_flight: usize) -> Self {
        Self {
            policy,
            dispatch_limit: Arc::new(Semaphore::new(max_in_flight.max(1))),
            session_disabled: AtomicBool::new(false),
        }
    }

    pub fn is_session_disabled(&self) -> bool {
        self.session_disabled.load(Ordering::SeqCst)
    }

    /// Executes `build_request`, retrying per policy. `build_request` is
    /// called once per attempt so the caller can re-sign or re-serialize
    /// the body if needed, mirroring the closure-based retry shape.
    pub async fn send_with_retry<F>(&self, mut build_request: F) -> Result<(), StructuredError>
    where
        F: FnMut() -> Result<reqwest::RequestBuilder, StructuredError>,
    {
        if self.session_disabled.load(Ordering::SeqCst) {
            return Err(StructuredError::new(
                ErrorCode::HTTP_UNEXPECTED_STATUS,
                "session disabled after prior 401/403".to_string(),
            ));
        }

        let _permit = self.dispatch_limit.acquire().await.ok();
        let mut attempt = 0u32;
        let mut prev_delay = self.policy.base_delay;

        loop {
            attempt += 1;
            let request = build_request()?;
            let outcome = self.run_one_attempt(request).await;

            match outcome {
                AttemptOutcome::Success => return Ok(()),
                AttemptOutcome::Terminal(err) => {
                    return Err(err);
                }
                AttemptOutcome::RetryAfter(explicit_delay) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(StructuredError::new(
                            ErrorCode::HTTP_UNEXPECTED_STATUS,
                            format!("exhausted {attempt} attempts"),
                        ));
                    }
                    let delay = if explicit_delay > Duration::ZERO {
                        explicit_delay
                    } else {
                        next_backoff(prev_delay, self.policy.max_delay)
                    };
                    prev_delay = delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_one_attempt(&self, request: reqwest::RequestBuilder) -> AttemptOutcome {
        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_timeout() {
                    return AttemptOutcome::RetryAfter(Duration::ZERO);
                }
                if e.is_connect() {
                    return AttemptOutcome::RetryAfter(Duration::ZERO);
                }
                return AttemptOutcome::Terminal(StructuredError::new(
                    ErrorCode::HTTP_CONNECTION_ERROR,
                    e.to_string(),
                ));
            }
        };

        let status = response.status();
        if status.is_success() {
            return AttemptOutcome::Success;
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.session_disabled.store(true, Ordering::SeqCst);
            return AttemptOutcome::Terminal(StructuredError::new(
                ErrorCode::HTTP_UNEXPECTED_STATUS,
                format!("{status}: unauthorized, session disabled"),
            ));
        }

        if status.as_u16() == 422 {
            let body = response.text().await.unwrap_or_default();
            return AttemptOutcome::Terminal(StructuredError::new(
                ErrorCode::HTTP_UNEXPECTED_STATUS,
                format!("422 validation rejected: {body}"),
            ));
        }

        if TRANSIENT_STATUSES.contains(&status.as_u16()) {
            let retry_after = parse_retry_after(response.headers());
            return AttemptOutcome::RetryAfter(retry_after.unwrap_or(Duration::ZERO));
        }

        AttemptOutcome::Terminal(StructuredError::new(
            ErrorCode::HTTP_UNEXPECTED_STATUS,
            format!("unexpected status {status}"),
        ))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form, e.g. "Sun, 06 Nov 1994 08:49:37 GMT" — RFC 1123, which
    // chrono's RFC 2822 parser accepts once "GMT" is normalized to an offset.
    let normalized = value.replace("GMT", "+0000");
    let when = chrono::DateTime::parse_from_rfc2822(&normalized).ok()?;
    let now = chrono::Utc::now();
    let delta = when.with_timezone(&chrono::Utc) - now;
    delta.to_std().ok()
}

/// Decorrelated jitter: next delay is a random point between the base
/// delay and three times the previous delay, capped at `max_delay`.
fn next_backoff(prev_delay: Duration, max_delay: Duration) -> Duration {
    let base_ms = prev_delay.as_millis().max(1) as u64;
    let upper = (base_ms * 3).min(max_delay.as_millis() as u64);
    let lower = base_ms.min(upper);
    let jittered = if upper > lower {
        rand::thread_rng().gen_range(lower..=upper)
    } else {
        upper
    };
    Duration::from_millis(jittered).min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn succeeds_without_retry_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let caller = HttpCaller::new(RetryPolicy::default(), 4);
        let url = server.uri();
        let result = caller.send_with_retry(|| Ok(reqwest::Client::new().post(&url))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retries_on_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        let caller = HttpCaller::new(policy, 4);
        let url = server.uri();
        let result = caller.send_with_retry(|| Ok(reqwest::Client::new().post(&url))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn disables_session_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let caller = HttpCaller::new(RetryPolicy::default(), 4);
        let url = server.uri();
        let result = caller.send_with_retry(|| Ok(reqwest::Client::new().post(&url))).await;
        assert!(result.is_err());
        assert!(caller.is_session_disabled());
    }

    #[tokio::test]
    async fn does_not_retry_on_422() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&server)
            .await;

        let caller = HttpCaller::new(RetryPolicy::default(), 4);
        let url = server.uri();
        let result = caller.send_with_retry(|| Ok(reqwest::Client::new().post(&url))).await;
        assert!(result.is_err());
        assert!(!caller.is_session_disabled());
    }
}
