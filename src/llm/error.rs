//! Typed errors for LLM transport, with retry classification.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Broad failure classes; retry policy keys off these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 from the provider; back off and retry.
    RateLimited,
    /// 5xx from the provider; transient, retry.
    ServerError,
    /// 4xx other than 429; the request itself is wrong, do not retry.
    ClientError,
    /// Connection, DNS, or timeout below HTTP.
    NetworkError,
    /// The provider answered with something we could not decode.
    ParseError,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmErrorKind::RateLimited => "rate_limited",
            LlmErrorKind::ServerError => "server_error",
            LlmErrorKind::ClientError => "client_error",
            LlmErrorKind::NetworkError => "network_error",
            LlmErrorKind::ParseError => "parse_error",
        };
        f.write_str(s)
    }
}

/// Map an HTTP status to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// Error from an LLM provider call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// Provider-suggested wait, from a Retry-After header.
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            message,
            status: Some(429),
            retry_after,
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ServerError,
            message,
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn client_error(status: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            message,
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn network_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            message,
            status: None,
            retry_after: None,
        }
    }

    pub fn parse_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            message,
            status: None,
            retry_after: None,
        }
    }

    /// Whether waiting and resending the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }

    /// Delay before retry `attempt` (0-based): exponential with 25% jitter,
    /// unless the provider told us exactly how long to wait.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(after) = self.retry_after {
            return after.min(MAX_DELAY);
        }
        let base = BASE_DELAY.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(MAX_DELAY.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Result alias for LLM transport.
pub type LlmResult<T> = Result<T, LlmError>;

/// Retry policy for transient transport failures. This budget sits inside a
/// single attempt; keep `max_retry_duration` below the router's per-attempt
/// timeout or the timeout will always win.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(45),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError) -> bool {
        error.is_transient()
    }
}
