//! Storage errors.

use sluice_core::{CoreError, ExecRecordId, Md5Digest};

/// Storage result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No dataset bytes for an identity
    #[error("No data for dataset {md5}")]
    NoData { md5: Md5Digest },

    /// No ExecRecord with that id
    #[error("ExecRecord not found: {id}")]
    RecordNotFound { id: ExecRecordId },

    /// ExecRecord cannot make the requested transition
    #[error("ExecRecord {id}: {reason}")]
    InvalidRecordState { id: ExecRecordId, reason: String },

    /// Two authoritative ExecRecords exist for the same key
    #[error("Corruption: ExecRecords {first} and {second} are both authoritative for {computation}")]
    DuplicateAuthoritative {
        computation: String,
        first: ExecRecordId,
        second: ExecRecordId,
    },

    /// Stored bytes no longer hash to their recorded identity
    #[error("Corruption: stored dataset {expected} now hashes to {actual}")]
    DatasetCorrupted { expected: Md5Digest, actual: Md5Digest },

    /// Filesystem error
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    /// Journal database error
    #[error("Journal error: {reason}")]
    Journal { reason: String },

    /// Encoding error
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl StoreError {
    /// Build an I/O error for a path
    #[must_use]
    pub fn io(path: impl AsRef<std::path::Path>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether this error signals a broken invariant rather than a bad request
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::DuplicateAuthoritative { .. } | Self::DatasetCorrupted { .. }
        )
    }
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Io { path, message } => Self::Io {
                path,
                reason: message,
            },
            other => Self::Serialization {
                reason: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::Validation {
            field: "store".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

macro_rules! journal_error {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    Self::Journal {
                        reason: err.to_string(),
                    }
                }
            }
        )*
    };
}

journal_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);
