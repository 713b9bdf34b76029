//! Error types for the bridge.
//!
//! Two families live here:
//! - [`BridgeError`] for structural problems found while loading metadata,
//!   configuration or extension implementations. These are fatal for the
//!   affected extension and are reported at registration time.
//! - [`ExtensionError`] for failures raised by extension bodies during an
//!   invocation. The dispatcher never lets these escape; every variant maps to
//!   a stable response code.

use crate::response::code;

/// Structural errors raised while building the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A method descriptor violates one of the table invariants.
    #[error("{reason}: {method}")]
    InvalidMethod { method: String, reason: String },

    /// An extension's method table is inconsistent as a whole.
    #[error("{reason}: {table}")]
    InvalidExtension {
        name: String,
        reason: String,
        table: String,
    },

    /// The extension name is already registered in the catalog.
    #[error("Extension already registered: {0}")]
    AlreadyRegistered(String),

    /// No factory or metadata exists for the extension.
    #[error("Extension not found: {0}")]
    NotFound(String),

    /// The factory failed to build an implementation instance.
    #[error("Failed to construct extension '{name}': {reason}")]
    ConstructionFailed { name: String, reason: String },

    /// An alias rule carries a pattern that does not compile.
    #[error("Invalid alias pattern '{pattern}': {source}")]
    InvalidAliasPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The bridge was built outside of a tokio runtime.
    #[error("No async runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Result alias for bridge construction.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised by extension bodies.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("{0}")]
    Generic(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Illegal request: {0}")]
    IllegalRequest(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid params: {0}")]
    Json(#[from] serde_json::Error),

    /// Extension-private failure; `code` should be >= 1000.
    #[error("{message}")]
    Custom { code: i32, message: String },
}

impl ExtensionError {
    /// Response code reported to the caller for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Generic(_) => code::GENERIC_ERROR,
            Self::IllegalArgument(_) | Self::Json(_) => code::ILLEGAL_ARGUMENT,
            Self::ServiceUnavailable(_) => code::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => code::TIMEOUT,
            Self::TooManyRequests => code::TOO_MANY_REQUEST,
            Self::IllegalRequest(_) => code::ILLEGAL_REQUEST,
            Self::FileNotFound(_) => code::FILE_NOT_FOUND,
            Self::Io(err) if err.kind() == std::io::ErrorKind::NotFound => code::FILE_NOT_FOUND,
            Self::Io(_) => code::IO_ERROR,
            Self::Custom { code, .. } => *code,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic(message.into())
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }
}

/// Result alias for extension bodies.
pub type ExtensionResult<T> = std::result::Result<T, ExtensionError>;
