use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for breakwater operations
#[derive(Debug, thiserror::Error)]
pub enum BreakwaterError {
    /// Admission denied by a rate limiter.
    #[error("Rate limit exceeded for {key}: retry after {retry_after:.3}s")]
    Throttled {
        /// Limiter key that rejected the request
        key: String,
        /// Configured limit
        limit: u64,
        /// Configured period in seconds
        period: f64,
        /// Seconds until at least one unit becomes available
        retry_after: f64,
    },

    /// Backend connectivity, timeout, or script failure.
    ///
    /// Never swallowed: the library fails closed by propagating this upward.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid algorithm, period, or missing required options at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The circuit breaker for a key is open.
    #[error("Circuit open for {key}: retry after {retry_after:.3}s")]
    CircuitOpen { key: String, retry_after: f64 },

    /// All retry attempts were exhausted.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<BreakwaterError>,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Standard error response body rendered at the HTTP edge.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl BreakwaterError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is a rate-limit rejection.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// The `retry_after` hint carried by throttle and circuit-open errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::Throttled { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Config(_) | Self::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::RetryExhausted { last, .. } => last.status_code(),
        }
    }
}

impl IntoResponse for BreakwaterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after().map(|s| s.ceil() as u64);

        tracing::error!(
            status = status.as_u16(),
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorBody {
            error: self.to_string(),
            retry_after,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for breakwater operations
pub type Result<T> = std::result::Result<T, BreakwaterError>;

#[cfg(feature = "redis-storage")]
impl From<redis::RedisError> for BreakwaterError {
    fn from(err: redis::RedisError) -> Self {
        BreakwaterError::Storage(format!("Redis error: {}", err))
    }
}
