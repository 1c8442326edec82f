//! Core error types for sluice.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding,

    /// Digest mismatch
    DigestMismatch { expected: String, actual: String },

    /// Invalid digest format
    InvalidDigest { reason: String },

    /// Invalid ID format
    InvalidId { reason: String },

    /// Parse error
    ParseError { message: String },

    /// Validation error
    Validation { field: String, reason: String },

    /// Not found
    NotFound { kind: String, id: String },

    /// Already exists
    AlreadyExists { kind: String, id: String },

    /// Capacity exceeded
    CapacityExceeded { resource: String, limit: u64 },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Cancelled
    Cancelled,

    /// Permission denied
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// Filesystem error, kept as text so the error stays `Clone`
    Io {
        /// Path involved, if known
        path: String,
        /// Error message
        message: String,
    },

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Build an I/O error for a path
    #[must_use]
    pub fn io(path: impl AsRef<std::path::Path>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::DigestMismatch { expected, actual } => {
                write!(f, "Digest mismatch: expected {}, got {}", expected, actual)
            }
            Self::InvalidDigest { reason } => write!(f, "Invalid digest: {}", reason),
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::ParseError { message } => write!(f, "Parse error: {}", message),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::CapacityExceeded { resource, limit } => {
                write!(f, "Capacity exceeded for {}: {}", resource, limit)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied: {}", operation)
            }
            Self::Io { path, message } => write!(f, "I/O error on {}: {}", path, message),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}

impl From<postcard::Error> for CoreError {
    fn from(_: postcard::Error) -> Self {
        Self::InvalidEncoding
    }
}
