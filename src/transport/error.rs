//! Error types shared by every transport backend.

use std::path::PathBuf;

use thiserror::Error;

/// Vendor error codes that signal account or bucket throttling.
pub const THROTTLE_CODES: [&str; 4] = [
    "ExceedAccountQPSLimit",
    "ExceedAccountRateLimit",
    "ExceedBucketQPSLimit",
    "ExceedBucketRateLimit",
];

/// HTTP status returned by providers when a request is throttled.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Errors produced by a single backend operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Local filesystem error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Local path involved in the failed operation.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Network-level HTTP failure (DNS, connect, TLS, body read).
    #[error("network error for {url}: {source}")]
    Network {
        /// Request URL, without embedded credentials.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP response with a status other than the one the operation requires.
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// Request URL, without embedded credentials.
        url: String,
        /// The returned status code.
        status: u16,
    },

    /// FTP command failure.
    #[error("FTP {operation} failed for {path}: {source}")]
    Ftp {
        /// FTP command that failed.
        operation: &'static str,
        /// Remote path the command targeted.
        path: String,
        /// The underlying FTP error.
        #[source]
        source: suppaftp::FtpError,
    },

    /// Object storage request failure.
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    /// A remote reference could not be mapped to something this backend can reach.
    #[error("invalid remote {url}: {reason}")]
    InvalidRemote {
        /// Remote URL, without embedded credentials.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Downloaded content does not match the advertised size or checksum.
    #[error("integrity check failed for {path}: {reason}")]
    Integrity {
        /// Local file that failed verification.
        path: PathBuf,
        /// What did not match.
        reason: String,
    },

    /// A DRS object could not be resolved to a downloadable URL.
    #[error("cannot resolve DRS object {object_id}: {reason}")]
    Resolution {
        /// DRS object id.
        object_id: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A file needs more parts than object storage allows.
    #[error("{path} is too large for multipart transfer ({size} bytes)")]
    TooLarge {
        /// Local file being transferred.
        path: PathBuf,
        /// Its size in bytes.
        size: u64,
    },

    /// A blocking worker panicked or was aborted.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an FTP error.
    pub fn ftp(operation: &'static str, path: impl Into<String>, source: suppaftp::FtpError) -> Self {
        Self::Ftp {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid-remote error.
    pub fn invalid_remote(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRemote {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an integrity error.
    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a DRS resolution error.
    pub fn resolution(object_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            object_id: object_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a too-large error.
    pub fn too_large(path: impl Into<PathBuf>, size: u64) -> Self {
        Self::TooLarge {
            path: path.into(),
            size,
        }
    }

    /// Returns the object storage error, if this is one.
    #[must_use]
    pub fn as_object_store(&self) -> Option<&ObjectStoreError> {
        match self {
            Self::ObjectStore(err) => Some(err),
            _ => None,
        }
    }
}

/// A failed object storage request, flattened from the SDK error.
#[derive(Debug, Clone, Error)]
#[error("{operation} s3://{bucket}/{key} failed (status {status:?}, code {code:?}): {message}")]
pub struct ObjectStoreError {
    /// SDK operation name, e.g. `PutObject`.
    pub operation: &'static str,
    /// Target bucket.
    pub bucket: String,
    /// Target key or prefix.
    pub key: String,
    /// HTTP status of the response, if one was received.
    pub status: Option<u16>,
    /// Provider error code, if the response carried one.
    pub code: Option<String>,
    /// Human-readable failure detail.
    pub message: String,
}

impl ObjectStoreError {
    /// Returns true when the provider is asking the client to slow down.
    #[must_use]
    pub fn is_throttle(&self) -> bool {
        self.status == Some(STATUS_TOO_MANY_REQUESTS)
            || self
                .code
                .as_deref()
                .is_some_and(|code| THROTTLE_CODES.contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_error(status: Option<u16>, code: Option<&str>) -> ObjectStoreError {
        ObjectStoreError {
            operation: "PutObject",
            bucket: "bucket".to_string(),
            key: "key".to_string(),
            status,
            code: code.map(str::to_string),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_throttle_detected_from_status_429() {
        assert!(store_error(Some(429), None).is_throttle());
    }

    #[test]
    fn test_throttle_detected_from_vendor_codes() {
        for code in THROTTLE_CODES {
            assert!(store_error(Some(503), Some(code)).is_throttle(), "{code}");
        }
    }

    #[test]
    fn test_other_errors_are_not_throttle() {
        assert!(!store_error(Some(403), Some("AccessDenied")).is_throttle());
        assert!(!store_error(None, None).is_throttle());
    }

    #[test]
    fn test_object_store_error_display_names_target() {
        let msg = TransferError::from(store_error(Some(404), Some("NoSuchKey"))).to_string();
        assert!(msg.contains("s3://bucket/key"), "Expected target in: {msg}");
        assert!(msg.contains("NoSuchKey"), "Expected code in: {msg}");
    }
}
