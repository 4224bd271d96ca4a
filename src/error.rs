//! Error types for the TabSync storage layer
//!
//! Every backend reports failures through [`StoreError`]. Callers branch on
//! [`StoreError::kind`] rather than on message text, so the HTTP layer can map
//! a missing row to 404 and a uniqueness violation to 409 regardless of which
//! backend produced it.

use thiserror::Error;

/// Programmatic classification of a [`StoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested row does not exist (or is soft-deleted)
    NotFound,
    /// A uniqueness or foreign-key constraint rejected the write
    Conflict,
    /// The backend could not be reached or failed its health check
    Unavailable,
    /// The backend does not implement the operation
    Unsupported,
    /// No usable backend configuration; unrecoverable
    Configuration,
    /// The caller supplied arguments the operation rejects
    InvalidInput,
    /// Any other backend failure
    Backend,
}

impl ErrorKind {
    /// Status code the HTTP layer renders for this kind
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unsupported => 501,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Unavailable | ErrorKind::Configuration | ErrorKind::Backend => 500,
        }
    }
}

/// Main error type for storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Entity not found
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// Uniqueness or referential constraint violated
    #[error("conflict in {operation}: {message}")]
    Conflict { operation: String, message: String },

    /// Backend unreachable, closed, or unhealthy
    #[error("backend unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    /// Operation not implemented by this backend
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Fatal configuration error (no backend, all connection strategies failed)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Caller supplied invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// REST table API answered with a failure-range status
    #[error("request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StoreError>,
    },
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Conflict {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &'static str, backend: &'static str) -> Self {
        StoreError::Unsupported { operation, backend }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::Unavailable { .. } => ErrorKind::Unavailable,
            StoreError::Unsupported { .. } => ErrorKind::Unsupported,
            StoreError::Configuration(_) => ErrorKind::Configuration,
            StoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            StoreError::Http { status, .. } => match status {
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                429 | 500..=599 => ErrorKind::Unavailable,
                _ => ErrorKind::Backend,
            },
            StoreError::Database(_) | StoreError::Serialization(_) => ErrorKind::Backend,
            StoreError::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Wrap with operation context, keeping the kind intact
    pub fn context(self, context: impl Into<String>) -> Self {
        StoreError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Map libsql failures: constraint violations become conflicts
impl From<libsql::Error> for StoreError {
    fn from(err: libsql::Error) -> Self {
        let message = err.to_string();
        if is_constraint_violation(&message) {
            StoreError::conflict("sql", message)
        } else {
            StoreError::Database(message)
        }
    }
}

fn is_constraint_violation(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("constraint failed") || lower.contains("sqlite_constraint")
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            StoreError::unavailable("http", err.to_string())
        } else if let Some(status) = err.status() {
            StoreError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            StoreError::Database(format!("HTTP error: {}", err))
        }
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(err: config::ConfigError) -> Self {
        StoreError::Configuration(err.to_string())
    }
}
