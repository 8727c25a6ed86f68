//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use displaydoc::Display;

use common::error::AtticError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Generic responses
    /// The requested object does not exist.
    NotFound,

    /// The server encountered an internal error or misconfiguration.
    InternalError,

    // Specialized responses
    /// Invalid compression type "{name}".
    InvalidCompressionType { name: String },

    /// Unsupported transport compression "{name}".
    UnsupportedTransportCompression { name: String },

    /// Invalid NAR URL "{url}": {reason}
    InvalidNarUrl { url: String, reason: &'static str },

    /// Failed to acquire lock on "{key}": {reason}
    LockUnavailable { key: String, reason: &'static str },

    /// Timed out waiting for another instance to finish fetching "{key}".
    PollTimeout { key: String },

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// Upstream error: {0}
    UpstreamError(AnyError),

    /// Manifest serialization error: {0}
    ManifestSerializationError(super::nix_manifest::Error),

    /// Error from the common components.
    AtticError(AtticError),
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn upstream_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::UpstreamError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::InternalError => "InternalError",
            Self::InvalidCompressionType { .. } => "InvalidCompressionType",
            Self::UnsupportedTransportCompression { .. } => "UnsupportedTransportCompression",
            Self::InvalidNarUrl { .. } => "InvalidNarUrl",
            Self::LockUnavailable { .. } => "LockUnavailable",
            Self::PollTimeout { .. } => "PollTimeout",
            Self::AtticError(e) => e.name(),
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::UpstreamError(_) => "UpstreamError",
            Self::ManifestSerializationError(_) => "ManifestSerializationError",
        }
    }

    /// Collapses an upstream failure into a plain not-found, which is
    /// how the pipeline reports "no such path" to a waiting client
    /// without leaking upstream transport details.
    pub fn into_not_found_if_upstream(self) -> Self {
        match self {
            Self::UpstreamError(_) => Self::NotFound,
            other => other,
        }
    }
}

impl StdError for ServerError {}

impl From<AtticError> for ServerError {
    fn from(error: AtticError) -> Self {
        Self::AtticError(error)
    }
}
