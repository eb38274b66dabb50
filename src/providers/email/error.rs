//! Error taxonomy shared by every mail driver.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type alias for mail driver operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Closed set of error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Id resolved to nothing after all lookup strategies.
    NotFound,
    /// Credentials rejected.
    Unauthorized,
    /// Provider throttling.
    RateLimited,
    /// Transport rejected an outgoing message.
    SendFailure,
    /// Operation has no equivalent on this provider.
    UnsupportedOperation,
    /// Provider id is unknown.
    UnsupportedProvider,
    /// Registered driver that does not implement the operation.
    NotImplemented,
    /// A protocol call exceeded its deadline.
    Timeout,
    /// Network or protocol failure.
    Connection,
    /// Caller supplied bad input.
    InvalidRequest,
    /// Provider returned an error the taxonomy does not name.
    Provider,
    /// Bug or unexpected local failure.
    Internal,
}

impl ErrorCode {
    /// Stable string form used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::SendFailure => "SEND_FAILURE",
            Self::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            Self::UnsupportedProvider => "UNSUPPORTED_PROVIDER",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::Timeout => "TIMEOUT",
            Self::Connection => "CONNECTION",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Provider => "PROVIDER",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during mail driver operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Authentication failed or credentials expired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Provider throttled the request.
    #[error("rate limit exceeded (status {status}), retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// HTTP status (429, or 403 for quota reasons). IMAP throttling reports 429.
        status: u16,
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport rejected an outgoing message.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// Operation has no faithful translation on this provider.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Provider id is not registered.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Operation is not implemented by this driver.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A protocol call did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Non-success HTTP response not covered by another variant.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Provider reason code, e.g. `rateLimitExceeded`.
        reason: Option<String>,
        /// Provider message or body.
        message: String,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Failure wrapped by the error envelope.
    #[error(transparent)]
    Operation(Box<OperationError>),
}

impl ProviderError {
    /// The innermost error, looking through envelope wrapping.
    pub fn root(&self) -> &ProviderError {
        match self {
            Self::Operation(op) => op.source.root(),
            other => other,
        }
    }

    /// Classifies the error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication(_) => ErrorCode::Unauthorized,
            Self::Connection(_) => ErrorCode::Connection,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::SendFailure(_) => ErrorCode::SendFailure,
            Self::UnsupportedOperation(_) => ErrorCode::UnsupportedOperation,
            Self::UnsupportedProvider(_) => ErrorCode::UnsupportedProvider,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Api { status: 401, .. } => ErrorCode::Unauthorized,
            Self::Api { status: 404, .. } => ErrorCode::NotFound,
            Self::Api { .. } => ErrorCode::Provider,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Operation(op) => op.code,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Self::RateLimited { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Provider reason code carried by the error, if any.
    pub fn reason(&self) -> Option<&str> {
        match self.root() {
            Self::Api { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for a not-implemented error on a named operation.
    pub fn not_implemented(operation: &str) -> Self {
        Self::NotImplemented(operation.to_string())
    }
}

/// Uniform error produced by the envelope around every driver operation.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed [{code}]: {source}")]
pub struct OperationError {
    /// Error class.
    pub code: ErrorCode,
    /// Driver operation name, e.g. `list`.
    pub operation: String,
    /// Sanitized call context.
    pub context: serde_json::Value,
    /// Original error.
    #[source]
    pub source: ProviderError,
}

impl From<OperationError> for ProviderError {
    fn from(err: OperationError) -> Self {
        Self::Operation(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_classifies_api_statuses() {
        let unauthorized = ProviderError::Api {
            status: 401,
            reason: None,
            message: "bad token".into(),
        };
        assert_eq!(unauthorized.code(), ErrorCode::Unauthorized);

        let other = ProviderError::Api {
            status: 500,
            reason: None,
            message: "boom".into(),
        };
        assert_eq!(other.code(), ErrorCode::Provider);
    }

    #[test]
    fn root_looks_through_operation_wrapping() {
        let wrapped: ProviderError = OperationError {
            code: ErrorCode::RateLimited,
            operation: "list".into(),
            context: serde_json::json!({}),
            source: ProviderError::RateLimited {
                status: 429,
                retry_after_secs: None,
            },
        }
        .into();

        assert_eq!(wrapped.code(), ErrorCode::RateLimited);
        assert_eq!(wrapped.status(), Some(429));
        assert!(matches!(
            wrapped.root(),
            ProviderError::RateLimited { status: 429, .. }
        ));
    }

    #[test]
    fn operation_error_message_names_operation() {
        let err: ProviderError = OperationError {
            code: ErrorCode::NotFound,
            operation: "get".into(),
            context: serde_json::json!({"id": "t-1"}),
            source: ProviderError::NotFound("t-1".into()),
        }
        .into();
        assert_eq!(err.to_string(), "get failed [NOT_FOUND]: not found: t-1");
    }

    #[test]
    fn error_code_serializes_screaming_case() {
        let json = serde_json::to_string(&ErrorCode::UnsupportedOperation).unwrap();
        assert_eq!(json, "\"UNSUPPORTED_OPERATION\"");
    }
}
