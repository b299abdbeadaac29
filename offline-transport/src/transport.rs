use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;

pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Fallback when a Retry-After header is present but unparseable.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// The inner send channel the offline engine wraps.
///
/// Implementations own the network stack; the engine only relies on
/// `send` resolving with a response (or nothing meaningful) on delivery
/// and failing with a [`TransportError`] when the attempt itself broke.
#[async_trait]
pub trait Transport<E>: Send + Sync {
    async fn send(&self, envelope: &E) -> Result<TransportResponse, TransportError>;

    async fn flush(&self, timeout: Option<Duration>) -> Result<bool, TransportError>;
}

/// Response surfaced by the inner transport.
///
/// Header names are stored lowercase; [`TransportResponse::with_header`]
/// normalizes on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
}

impl TransportResponse {
    #[must_use]
    pub fn with_status(status: u16) -> Self {
        Self {
            status_code: Some(status),
            headers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        self.headers.get(RETRY_AFTER_HEADER).map(String::as_str)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport closed")]
    Closed,
}

/// Parses a Retry-After header value into a delay relative to `now`.
///
/// Accepts delay-seconds (integer or fractional) or an HTTP-date. Dates in
/// the past clamp to zero; unparseable values fall back to
/// [`DEFAULT_RETRY_AFTER`].
#[must_use]
pub fn parse_retry_after(value: &str, now: SystemTime) -> Duration {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() {
            if seconds <= 0.0 {
                return Duration::ZERO;
            }
            return Duration::from_secs_f64(seconds);
        }
        return DEFAULT_RETRY_AFTER;
    }

    if let Ok(date) = httpdate::parse_http_date(value) {
        return date.duration_since(now).unwrap_or(Duration::ZERO);
    }

    DEFAULT_RETRY_AFTER
}
