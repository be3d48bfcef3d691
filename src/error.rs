//! Error types for fluxgate

/// Result type alias for fluxgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for fluxgate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration could not be loaded or is invalid; fatal at startup
    #[error("illegal config: {0}")]
    IllegalConfig(String),
    /// A keymap or next-hop entry references a backend that was never defined
    #[error("backend does not exist: {0}")]
    BackendNotExist(String),
    /// Query rejected by the deny/allow policy
    #[error("query forbidden")]
    QueryForbidden,
    /// Query string is empty after trimming
    #[error("empty query")]
    EmptyQuery,
    /// The query names no measurement the probe can extract
    #[error("can't get measurement: {0}")]
    NoMeasurement(String),
    /// The query names no database the probe can extract
    #[error("can't get database: {0}")]
    NoDatabase(String),
    /// No routing entry for this (db, measurement) pair
    #[error("unknown measurement: {0}")]
    UnknownMeasurement(String),
    /// Write submitted to a backend after shutdown
    #[error("write in a closed backend")]
    Closed,
    /// Upstream answered HTTP 400; the payload is permanently dropped
    #[error("upstream rejected the request")]
    BadRequest,
    /// Upstream answered HTTP 404; the payload is permanently dropped
    #[error("upstream endpoint not found")]
    NotFound,
    /// Retryable upstream failure (5xx, overload, refused connection)
    #[error("upstream error: {0}")]
    Upstream(String),
    /// Malformed line-protocol input; the line is dropped, the batch continues
    #[error("scan error: {0}")]
    Scan(String),
    /// No backend produced a response for this query
    #[error("query error")]
    QueryFailed,
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the upstream outcome is terminal: retrying cannot succeed,
    /// the payload must be dropped rather than spooled.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::BadRequest | Error::NotFound)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
