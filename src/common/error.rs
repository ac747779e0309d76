//! Error types for beanproxy

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Node Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Node error from {node}: {message}")]
    NodeError { node: String, message: String },

    // === Quorum Errors ===
    #[error("Write failed: {acks} of {needed} acknowledgements")]
    PartialWrite { acks: usize, needed: usize },

    #[error("Read quorum failed: {responses} of {needed} responses")]
    ReadQuorumFailed { responses: usize, needed: usize },

    #[error("Version conflict: stale revision for key {0}")]
    VersionConflict(String),

    #[error("No reachable node for bucket {0}")]
    NoReachableNode(usize),

    // === Client Errors ===
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Bad data chunk")]
    BadDataChunk,

    #[error("Object too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    // === Backend Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend disabled: {0}")]
    BackendDisabled(&'static str),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Does this failure count against a node's circuit breaker?
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Reply line for the memcache text protocol
    pub fn to_wire_reply(&self) -> &'static str {
        match self {
            Error::VersionConflict(_) => "EXISTS",
            Error::BadDataChunk => "CLIENT_ERROR bad data chunk",
            Error::Protocol(_) => "CLIENT_ERROR bad command line format",
            Error::TooLarge { .. } => "SERVER_ERROR object too large for cache",
            Error::ReadQuorumFailed { .. } => "SERVER_ERROR read failed",
            _ => "SERVER_ERROR write failed",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidKey(_)
            | Error::InvalidConfig(_)
            | Error::BadDataChunk
            | Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::VersionConflict(_) => StatusCode::CONFLICT,
            Error::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::PartialWrite { .. }
            | Error::ReadQuorumFailed { .. }
            | Error::NoReachableNode(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
