use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Rate limiter error types
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration errors (invalid policy, unknown resolver spec, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Store transport errors (network, timeout, protocol-level I/O)
    #[error("Store error: {0}")]
    Store(String),

    /// Store replied with something that is not a valid decision result.
    /// This is a bug, not load; it must never be treated as a limit outcome.
    #[error("Store protocol violation: {0}")]
    StoreProtocol(String),

    /// Store call exceeded the configured deadline
    #[error("Store call timed out after {0:?}")]
    StoreTimeout(std::time::Duration),

    /// Key resolver failures (custom resolvers performing I/O)
    #[error("Key resolver error: {0}")]
    Resolver(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            LimiterError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::StoreProtocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::StoreTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::Resolver(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LimiterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            LimiterError::Configuration(_) => "CONFIGURATION_ERROR",
            LimiterError::Store(_) => "STORE_ERROR",
            LimiterError::StoreProtocol(_) => "STORE_PROTOCOL_VIOLATION",
            LimiterError::StoreTimeout(_) => "STORE_TIMEOUT",
            LimiterError::Resolver(_) => "RESOLVER_ERROR",
            LimiterError::Io(_) => "IO_ERROR",
        }
    }
}

/// Convert LimiterError to HTTP response
impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        tracing::error!(
            error_code = error_code,
            status_code = status.as_u16(),
            message = %message,
            "Rate limiter failure"
        );

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

/// Conversion from redis::RedisError
impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        LimiterError::Store(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Configuration(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            LimiterError::Configuration("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            LimiterError::Store("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            LimiterError::Configuration("test".to_string()).error_code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(
            LimiterError::StoreProtocol("short reply".to_string()).error_code(),
            "STORE_PROTOCOL_VIOLATION"
        );
        assert_eq!(
            LimiterError::StoreTimeout(std::time::Duration::from_secs(1)).error_code(),
            "STORE_TIMEOUT"
        );
    }
}
