//! Storage error types.
//!
//! Remote failures are normalised into the same two kinds a local
//! filesystem backend raises: "not found" and a generic I/O failure.
//! Both carry the operation name, the storage name and the provider
//! detail.  Configuration and usage mistakes get their own variants so
//! callers can tell a misconfigured adapter from a failing bucket.

use std::io;

use thiserror::Error;

/// Provider error codes that mean "the key does not exist".
///
/// `GetObject` reports `NoSuchKey` in its XML body; `HeadObject` has no
/// body, so the SDK surfaces `NotFound` or just the HTTP status.
const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound", "404"];

/// An error reported by an [`ObjectClient`](crate::client::backend::ObjectClient) call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClientError {
    /// Provider-defined error code, when the provider sent one.
    pub code: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl ClientError {
    /// Build an error carrying a provider error code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Build an error for a failure that never reached the provider.
    pub fn without_code(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// The provider error code, or `"Unknown"`.
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or("Unknown")
    }

    /// Whether the code says the key does not exist.
    pub fn is_not_found(&self) -> bool {
        NOT_FOUND_CODES.contains(&self.code())
    }
}

/// Errors returned by the storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The remote object does not exist.
    #[error("S3Storage error at {name:?} ({operation}): {message}")]
    NotFound {
        operation: &'static str,
        name: String,
        message: String,
    },

    /// Any other remote-call failure.
    #[error("S3Storage error at {name:?} ({operation}): {message}")]
    Io {
        operation: &'static str,
        name: String,
        message: String,
    },

    /// Invalid settings, including unknown override keys.
    #[error("S3Storage is improperly configured: {0}")]
    Config(String),

    /// A storage name that is not of the form `scheme://bucket/path`, or a
    /// file name that cannot be made safe.
    #[error("invalid storage name {0:?}")]
    InvalidName(String),

    /// The name's scheme has no configured endpoint.
    #[error("no S3 endpoint is configured for scheme {0:?}")]
    UnknownScheme(String),

    /// The caller used the API in a way it does not support.
    #[error("{0}")]
    Usage(String),

    /// Failure on a local temporary buffer.
    #[error("local buffer error: {0}")]
    LocalIo(#[from] io::Error),
}

impl StorageError {
    /// Translate a client error raised by `operation` on `name`.
    pub fn from_client(operation: &'static str, name: &str, err: ClientError) -> Self {
        let message = format!("{} ({})", err.message, err.code());
        if err.is_not_found() {
            StorageError::NotFound {
                operation,
                name: name.to_string(),
                message,
            }
        } else {
            StorageError::Io {
                operation,
                name: name.to_string(),
                message,
            }
        }
    }

    /// Whether this is the not-found kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::NotFound { .. } => io::ErrorKind::NotFound,
            StorageError::LocalIo(inner) => inner.kind(),
            StorageError::Usage(_) | StorageError::InvalidName(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

// -- Tests -------------------------------------------------------------------
