//! Error types for remote service clients.

use thiserror::Error;

/// Remote service errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The service has no entry for the request (index miss, unknown task)
    #[error("{service}: not found: {what}")]
    NotFound { service: &'static str, what: String },

    /// Service unavailable or failing (transient)
    #[error("{service} unavailable (transient): {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    /// Rate limited by the service (transient)
    #[error("{service} rate limited the request")]
    RateLimited {
        service: &'static str,
        retry_after_secs: Option<u64>,
    },

    /// Service rejected the request (permanent)
    #[error("{service} returned {status}: {message}")]
    Api {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// Response did not match the expected shape
    #[error("invalid payload from {context}: {message}")]
    InvalidPayload { context: String, message: String },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Classify a non-success HTTP status.
    pub fn from_http_status(
        service: &'static str,
        status: u16,
        retry_after_secs: Option<u64>,
        body: &str,
    ) -> Self {
        match status {
            404 => ClientError::NotFound {
                service,
                what: truncate(body, 200),
            },
            429 => ClientError::RateLimited {
                service,
                retry_after_secs,
            },
            500..=599 => ClientError::Upstream {
                service,
                message: format!("HTTP {}: {}", status, truncate(body, 200)),
            },
            _ => ClientError::Api {
                service,
                status,
                message: truncate(body, 200),
            },
        }
    }

    pub fn invalid_payload(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            context: context.into(),
            message: message.into(),
        }
    }

    /// True when the entry simply does not exist; callers log and continue.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    /// True when re-running the scan later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Upstream { .. } | ClientError::RateLimited { .. } => true,
            ClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
