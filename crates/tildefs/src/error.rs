//! Filestore error types.

use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Filestore error type.
#[derive(Debug, Error)]
pub enum FilestoreError {
    /// A path component is empty, purely dots, or uses characters outside
    /// the filesystem-safe set.
    #[error("invalid path component: {0:?}")]
    InvalidComponent(String),

    /// A public operation addressed the reserved `~` value holder.
    #[error("reserved component `~` in path: {0}")]
    ReservedComponent(String),

    /// The target lies outside the transaction's root.
    #[error("{path} is outside the jurisdiction of {root}")]
    OutOfJurisdiction { path: String, root: String },

    /// The transaction has been ended.
    #[error("transaction at {0} has ended")]
    TransactionEnded(String),

    /// A stream was abandoned or used after it finished.
    #[error("broken stream: {0}")]
    BrokenStream(String),

    /// Stored data was requested as text but is not UTF-8.
    #[error("data at {path} is not valid UTF-8")]
    InvalidUtf8 {
        path: String,
        #[source]
        source: FromUtf8Error,
    },

    /// Underlying filesystem failure.
    #[error("{op} failed at {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FilestoreError {
    /// Create an InvalidComponent error.
    pub fn invalid_component(component: impl Into<String>) -> Self {
        Self::InvalidComponent(component.into())
    }

    /// Create a ReservedComponent error.
    pub fn reserved_component(path: impl Into<String>) -> Self {
        Self::ReservedComponent(path.into())
    }

    /// Create an OutOfJurisdiction error.
    pub fn out_of_jurisdiction(path: impl Into<String>, root: impl Into<String>) -> Self {
        Self::OutOfJurisdiction {
            path: path.into(),
            root: root.into(),
        }
    }

    /// Create a TransactionEnded error.
    pub fn transaction_ended(root: impl Into<String>) -> Self {
        Self::TransactionEnded(root.into())
    }

    /// Create a BrokenStream error.
    pub fn broken_stream(msg: impl Into<String>) -> Self {
        Self::BrokenStream(msg.into())
    }

    /// Wrap an I/O error with the operation and the real path it touched.
    pub fn io(op: &'static str, path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Returns true for the validation errors raised before any filesystem
    /// access.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidComponent(_) | Self::ReservedComponent(_) | Self::OutOfJurisdiction { .. }
        )
    }
}

/// Convert FilestoreError to std::io::Error so it can surface through
/// `AsyncRead`/`AsyncWrite`.
impl From<FilestoreError> for io::Error {
    fn from(e: FilestoreError) -> Self {
        match e {
            FilestoreError::Io { source, .. } => source,
            FilestoreError::InvalidComponent(_) | FilestoreError::ReservedComponent(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
            FilestoreError::OutOfJurisdiction { .. } => {
                io::Error::new(io::ErrorKind::PermissionDenied, e)
            }
            FilestoreError::TransactionEnded(_) | FilestoreError::BrokenStream(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, e)
            }
            FilestoreError::InvalidUtf8 { .. } => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// Filestore result type.
pub type FilestoreResult<T> = Result<T, FilestoreError>;
