/*
[INPUT]:  Error sources (transport, exchange envelope, serialization, caller input, WebSocket)
[OUTPUT]: Classified error type with retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or changing the retry classification
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Return codes that are accepted as a successful envelope.
pub const ALLOWED_RET_CODES: [i64; 3] = [0, 10001, 110043];

/// Return codes treated as transient and re-sent immediately.
pub const TRANSIENT_RET_CODES: [i64; 2] = [10001, 110043];

/// Main error type for the Bybit adapter
#[derive(Error, Debug)]
pub enum BybitError {
    /// Low-level transport failure (connect, timeout, broken body)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Exchange answered with a non-zero return code outside the allow-list
    #[error("API error (code {code}): {message}")]
    Api { code: i64, message: String },

    /// Envelope is missing `retCode`/`retMsg` or is not JSON
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Caller supplied arguments the exchange would reject
    #[error("Validation failed: {0}")]
    Validation(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BybitError {
    /// Transport failures that warrant tearing down the HTTP session
    pub fn is_transport(&self) -> bool {
        match self {
            BybitError::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            _ => false,
        }
    }

    /// Exchange code that is re-sent immediately instead of backing off
    pub fn is_transient_code(&self) -> bool {
        matches!(self, BybitError::Api { code, .. } if TRANSIENT_RET_CODES.contains(code))
    }

    /// Check if the error is retryable with backoff.
    ///
    /// Malformed envelopes and validation failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BybitError::Http(_) | BybitError::Api { .. })
    }

    pub fn api_code(&self) -> Option<i64> {
        match self {
            BybitError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Create an API error from a non-2xx HTTP status and body
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        BybitError::Api {
            code: i64::from(status.as_u16()),
            message: message.into(),
        }
    }
}

/// Result type alias for Bybit operations
pub type Result<T> = std::result::Result<T, BybitError>;
