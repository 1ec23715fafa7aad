//! Content verification against a published checksum.

use std::path::Path;

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use crate::transport::TransferError;

/// Checksum type name for MD5 digests.
pub const CHECKER_TYPE_MD5: &str = "md5";

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Verifies a local file against an expected checksum.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Returns whether the file at `path` matches.
    async fn check(&self, path: &Path) -> Result<bool, TransferError>;
}

/// Compares the hex MD5 digest of a file, case-insensitively.
#[derive(Debug, Clone)]
pub struct Md5Checker {
    expected: String,
}

impl Md5Checker {
    /// Creates a checker for a hex-encoded digest.
    #[must_use]
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl Checker for Md5Checker {
    async fn check(&self, path: &Path) -> Result<bool, TransferError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let mut hasher = Md5::new();
        let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()).eq_ignore_ascii_case(self.expected.trim()))
    }
}

/// Picks a checker for a `(type, checksum)` pair, if the type is supported.
#[must_use]
pub fn checker_for(kind: &str, checksum: &str) -> Option<Box<dyn Checker>> {
    if kind.eq_ignore_ascii_case(CHECKER_TYPE_MD5) {
        Some(Box::new(Md5Checker::new(checksum)))
    } else {
        None
    }
}
