use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Classified outcome of a network call.
///
/// The classification table lives here so every boundary (object store,
/// vector index, processor API) agrees on what is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection failures, socket timeouts, DNS errors, HTTP 5xx/408/429.
    #[error("transient: {message}")]
    Transient {
        message: String,
        /// Server-provided delay hint (Retry-After), if any.
        retry_after: Option<Duration>,
    },
    /// Anything that will not get better by waiting (other 4xx, decode
    /// failures, malformed responses).
    #[error("permanent: {message}")]
    Permanent { message: String },
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Permanent { .. } => None,
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::transient(err.to_string())
        } else if err.is_request() && err.status().is_none() {
            // Request never reached the server (DNS, TLS, broken socket).
            Self::transient(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }

    pub fn from_status(
        status: reqwest::StatusCode,
        retry_after: Option<Duration>,
        body: String,
    ) -> Self {
        let message = format!("http {status}: {body}");
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Self::Transient {
                message,
                retry_after,
            }
        } else {
            Self::Permanent { message }
        }
    }
}

/// Parses a `Retry-After: <seconds>` header, ignoring the HTTP-date form.
pub fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Exponential backoff with full jitter: each delay is drawn uniformly from
/// `[0, min(max_delay, base * 2^(attempt-1))]`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the jitter window for the given 1-based attempt.
    fn delay_cap(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap_ms = self.delay_cap(attempt).as_millis() as u64;
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
    }

    /// Runs `op`, retrying transient failures until the attempt budget is
    /// spent. A server-provided Retry-After hint overrides the jittered
    /// delay, clamped to `max_delay`.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts.max(1) => {
                    let delay = err
                        .retry_after()
                        .map(|hint| hint.min(self.max_delay))
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    tracing::warn!(
                        call = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
