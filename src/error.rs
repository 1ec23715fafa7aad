//! Top-level error taxonomy for the filer.
//!
//! Every failure that leaves the library is a [`FilerError`]. Backend failures
//! are carried as [`TransferError`] inside [`FilerError::Internal`] so the
//! original cause (path, URL, provider code) survives to the final log line.

use thiserror::Error;

use crate::transport::TransferError;

/// Errors surfaced by manifest parsing, configuration and orchestration.
#[derive(Debug, Error)]
pub enum FilerError {
    /// A manifest entry, URL, scheme, type or configuration value is malformed.
    #[error("invalid argument {param}: {value}")]
    InvalidArgument {
        /// Name of the offending parameter.
        param: String,
        /// The rejected value (or a short description of it).
        value: String,
    },

    /// A required file is absent.
    #[error("{what} not found: {value}")]
    NotFound {
        /// Kind of thing that was looked up.
        what: &'static str,
        /// The missing path or identifier.
        value: String,
    },

    /// A lower-level I/O, network or SDK failure.
    #[error("{context}: {source}")]
    Internal {
        /// What the filer was doing when the failure happened.
        context: String,
        /// The underlying failure.
        #[source]
        source: TransferError,
    },

    /// Access was refused. Not produced by the current flows.
    #[error("permission denied for {param}: {value}")]
    PermissionDenied {
        /// Name of the protected parameter.
        param: String,
        /// The rejected value.
        value: String,
    },

    /// The run was cancelled before it finished.
    #[error("transfer cancelled")]
    Cancelled,
}

/// Discriminant of [`FilerError`], handy for assertions and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilerErrorKind {
    /// See [`FilerError::InvalidArgument`].
    InvalidArgument,
    /// See [`FilerError::NotFound`].
    NotFound,
    /// See [`FilerError::Internal`].
    Internal,
    /// See [`FilerError::PermissionDenied`].
    PermissionDenied,
    /// See [`FilerError::Cancelled`].
    Cancelled,
}

impl FilerError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidArgument {
            param: param.into(),
            value: value.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: &'static str, value: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            value: value.into(),
        }
    }

    /// Wraps a backend failure with context.
    ///
    /// A cancelled backend operation becomes [`FilerError::Cancelled`] rather
    /// than an internal failure.
    pub fn internal(context: impl Into<String>, source: TransferError) -> Self {
        if matches!(source, TransferError::Cancelled) {
            return Self::Cancelled;
        }
        Self::Internal {
            context: context.into(),
            source,
        }
    }

    /// Returns the error discriminant.
    #[must_use]
    pub fn kind(&self) -> FilerErrorKind {
        match self {
            Self::InvalidArgument { .. } => FilerErrorKind::InvalidArgument,
            Self::NotFound { .. } => FilerErrorKind::NotFound,
            Self::Internal { .. } => FilerErrorKind::Internal,
            Self::PermissionDenied { .. } => FilerErrorKind::PermissionDenied,
            Self::Cancelled => FilerErrorKind::Cancelled,
        }
    }
}
