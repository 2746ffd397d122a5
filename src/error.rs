use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for proxyscan
#[derive(Error, Debug)]
pub enum ProxyScanError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Subscription errors
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("All {} subscription sources failed: {}", .causes.len(), SourceFailures(.causes))]
    AggregateFetchFailure { causes: Vec<SourceFailure> },

    // Pool errors
    #[error("Proxy unavailable: {0}")]
    ProxyUnavailable(String),

    #[error("Tunnel engine unavailable: {engine} ({reason})")]
    EngineUnavailable { engine: String, reason: String },

    #[error(
        "Proxy pool is required but no usable nodes were found after {tried} attempts against probe URL {probe_url}; \
         check the subscription URLs, the engine binaries, the probe URL, or set PROXYSCAN_POOL_REQUIRED=false"
    )]
    PoolExhausted { probe_url: String, tried: u64 },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxyscan operations
pub type Result<T> = std::result::Result<T, ProxyScanError>;

impl ProxyScanError {
    /// Errors that should stop the caller instead of degrading
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyScanError::PoolExhausted { .. }
                | ProxyScanError::EngineUnavailable { .. }
                | ProxyScanError::InvalidConfig(_)
                | ProxyScanError::DatabaseConnection(_)
        )
    }

    /// Check if retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyScanError::Fetch(e) => e.is_retryable(),
            ProxyScanError::Database(_) | ProxyScanError::Http(_) => true,
            _ => false,
        }
    }
}

/// A malformed subscription payload or node entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("unsupported proxy type: {0}")]
    UnsupportedType(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid base64 payload")]
    InvalidBase64,

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl From<url::ParseError> for ParseError {
    fn from(err: url::ParseError) -> Self {
        ParseError::InvalidUri(err.to_string())
    }
}

/// Failure of a single outbound fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP status {0}")]
    Http(u16),

    #[error("blocked page returned")]
    BlockedPage,

    #[error("invalid body: {0}")]
    InvalidBody(String),
}

impl FetchError {
    /// Transport failures, timeouts and 5xx responses are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Http(status) => *status >= 500,
            FetchError::BlockedPage | FetchError::InvalidBody(_) => false,
        }
    }

    /// Map a reqwest error onto the fetch taxonomy
    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else if let Some(status) = err.status() {
            FetchError::Http(status.as_u16())
        } else if err.is_decode() || err.is_body() {
            FetchError::InvalidBody(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// One subscription URL that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub url: String,
    pub cause: String,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.cause)
    }
}

struct SourceFailures<'a>(&'a [SourceFailure]);

impl fmt::Display for SourceFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

// Convert from reqwest client construction errors
impl From<reqwest::Error> for ProxyScanError {
    fn from(err: reqwest::Error) -> Self {
        ProxyScanError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyScanError {
    fn from(err: serde_json::Error) -> Self {
        ProxyScanError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyScanError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyScanError::Serialization(err.to_string())
    }
}
