//! Error types for druid-warden

use std::fmt;

/// Result type alias for druid-warden operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for druid-warden
#[derive(Debug)]
pub enum Error {
    /// Object store errors
    ObjectStore(object_store::Error),
    /// HTTP transport errors
    Http(reqwest::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Granularity string not understood
    UnsupportedGranularity(String),
    /// Interval could not be parsed or is empty
    InvalidInterval(String),
    /// No reachable inventory host or execution-service leader
    Connectivity(String),
    /// A raw input root exists but is a file
    NotADirectory(String),
    /// Segment metadata store error
    Metadata(String),
    /// Analytical store query error
    Query(String),
    /// Job submission or poll rejected by the overlord
    Submission { status: u16, body: String },
    /// Response did not have the expected shape
    Protocol(String),
    /// Leader redirects exceeded the configured bound
    TooManyRedirects { attempts: u32, last_location: String },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::UnsupportedGranularity(g) => write!(f, "Unsupported granularity: {}", g),
            Error::InvalidInterval(msg) => write!(f, "Invalid interval: {}", msg),
            Error::Connectivity(msg) => write!(f, "Connectivity error: {}", msg),
            Error::NotADirectory(path) => write!(f, "Input root is not a directory: {}", path),
            Error::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Submission { status, body } => {
                write!(f, "Overlord rejected request ({}): {}", status, body)
            }
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::TooManyRedirects {
                attempts,
                last_location,
            } => write!(
                f,
                "Too many redirects: gave up after {} attempts, last location {}",
                attempts, last_location
            ),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<chrono::ParseError> for Error {
    fn from(e: chrono::ParseError) -> Self {
        Error::InvalidInterval(e.to_string())
    }
}
