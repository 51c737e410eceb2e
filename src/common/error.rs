//! Error types for clusterconf

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config Errors ===
    #[error("Loading configuration failed: {0}")]
    ConfigLoad(String),

    #[error("Fetching configuration failed: {0}")]
    ConfigFetch(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidate(String),

    #[error("Applying configuration failed: {0}")]
    ConfigApply(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    // === 2PC Errors ===
    #[error("Two-phase commit is already in progress")]
    Atomic,

    #[error("Prepare failed on {uri}: {reason}")]
    PrepareFailed { uri: String, reason: String },

    #[error("Commit failed on {uri}: {reason}")]
    CommitFailed { uri: String, reason: String },

    // === Role Errors ===
    #[error("Registering role failed: {0}")]
    RegisterRole(String),

    #[error("Failover step failed: {0}")]
    Failover(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::ConfigFetch(_)
        )
    }

    /// Stable kind tag carried over the wire so peers can rebuild the error.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::ConfigLoad(_) => "ConfigLoad",
            Error::ConfigFetch(_) => "ConfigFetch",
            Error::ConfigValidate(_) => "ConfigValidate",
            Error::ConfigApply(_) => "ConfigApply",
            Error::Rollback(_) => "Rollback",
            Error::Atomic => "Atomic",
            Error::PrepareFailed { .. } => "PrepareFailed",
            Error::CommitFailed { .. } => "CommitFailed",
            Error::RegisterRole(_) => "RegisterRole",
            Error::Failover(_) => "Failover",
            Error::Http(_) => "Http",
            Error::ConnectionFailed(_) => "ConnectionFailed",
            Error::Timeout(_) => "Timeout",
            Error::Internal(_) => "Internal",
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "ConfigLoad" => Error::ConfigLoad(message),
            "ConfigFetch" => Error::ConfigFetch(message),
            "ConfigValidate" => Error::ConfigValidate(message),
            "ConfigApply" => Error::ConfigApply(message),
            "Rollback" => Error::Rollback(message),
            "Atomic" => Error::Atomic,
            "RegisterRole" => Error::RegisterRole(message),
            "Failover" => Error::Failover(message),
            "ConnectionFailed" => Error::ConnectionFailed(message),
            "Timeout" => Error::Timeout(message),
            "Internal" => Error::Internal(message),
            _ => Error::Http(message),
        }
    }

    /// Convert to HTTP status code for RPC responses
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::ConfigValidate(_) | Error::RegisterRole(_) => StatusCode::BAD_REQUEST,
            Error::Atomic => StatusCode::CONFLICT,
            Error::ConfigLoad(_) => StatusCode::NOT_FOUND,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::ConnectionFailed(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let err = Error::ConfigValidate("vshard section is missing".into());
        let kind = err.wire_kind();
        let rebuilt = Error::from_wire(kind, "vshard section is missing".into());
        assert!(matches!(rebuilt, Error::ConfigValidate(_)));
        assert_eq!(rebuilt.to_string(), err.to_string());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(Error::ConfigFetch("no peer".into()).is_retryable());
        assert!(!Error::ConfigValidate("bad".into()).is_retryable());
        assert!(!Error::Atomic.is_retryable());
    }

    #[test]
    fn test_http_status() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::ConfigValidate("x".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Atomic.to_http_status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::ConfigApply("x".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
