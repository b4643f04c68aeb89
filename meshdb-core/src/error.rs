//! # Error Handling
//!
//! Error types shared by every meshdb component.
//!
//! ## Design Principles
//!
//! 1. **Typed**: every fallible core operation returns one of these kinds
//! 2. **Contextual**: errors carry the id/path/peer they refer to
//! 3. **Recoverable**: callers can distinguish retryable failures
//!
//! Background workers never surface these upward; they log and continue.

use thiserror::Error;

/// Result type alias for meshdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for meshdb
#[derive(Error, Debug)]
pub enum Error {
    /// A document, backup, collection or index that does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Unique-index violation or name collision
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Unparseable JSON, invalid predicate, bad envelope
    #[error("malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },

    /// Disk-level failure: full, permissions, corrupted file
    #[error("persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Publish failure, closed subscription, peer timeout
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A memory or document-count ceiling refused the operation
    #[error("capacity exceeded: {resource}")]
    Capacity { resource: String },

    /// Raw IO outside the persistence layer
    #[error("io error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Invariant violated; fatal for the operation, not the process
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
        }
    }

    pub fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        Error::Malformed {
            what,
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Error::Persistence {
            message: message.into(),
            source: None,
        }
    }

    pub fn persistence_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Persistence {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Check if the operation may succeed on retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Capacity { .. } => true,
            Error::Persistence { .. } => false,
            Error::Io { .. } => false,
            Error::Internal { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring and API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Conflict { .. } => "CONFLICT",
            Error::Malformed { .. } => "MALFORMED",
            Error::Persistence { .. } => "PERSISTENCE_ERROR",
            Error::Transport { .. } => "TRANSPORT_ERROR",
            Error::Capacity { .. } => "CAPACITY_EXCEEDED",
            Error::Io { .. } => "IO_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Malformed {
            what: "json",
            message: err.to_string(),
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Internal {
            message: format!("{}: {}", f(), e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::not_found("document", "x").error_code(), "NOT_FOUND");
        assert_eq!(Error::conflict("dup").error_code(), "CONFLICT");
        assert_eq!(
            Error::transport("publish failed").error_code(),
            "TRANSPORT_ERROR"
        );
    }

    #[test]
    fn transport_errors_are_recoverable() {
        assert!(Error::transport("timeout").is_recoverable());
        assert!(!Error::persistence("disk full").is_recoverable());
    }
}
