//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type AtticResult<T> = Result<T, AtticError>;

/// An error.
#[derive(Debug, Display)]
pub enum AtticError {
    /// Signing error: {0}
    SigningError(super::signing::Error),

    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl AtticError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SigningError(_) => "SigningError",
            Self::HashError(_) => "HashError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for AtticError {}

impl From<io::Error> for AtticError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::signing::Error> for AtticError {
    fn from(error: super::signing::Error) -> Self {
        Self::SigningError(error)
    }
}

impl From<super::hash::Error> for AtticError {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}
