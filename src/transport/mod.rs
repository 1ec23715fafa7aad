//! Backend transports.
//!
//! Every remote protocol implements [`Transport`]: upload or download one
//! file or one directory tree. Backends without native recursive upload use
//! [`walk::upload_dir_with`] to fan a directory out into single-file uploads.
//!
//! All operations take a [`TransferContext`] carrying the run's cancellation
//! token. Backends race their I/O against it via [`TransferContext::run`] so a
//! cancelled run stops promptly with [`TransferError::Cancelled`].

mod error;
pub mod drs;
pub mod ftp;
pub mod http;
pub mod local;
pub mod object;
pub mod registry;
pub mod walk;

use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::manifest::RemoteUrl;

pub use error::{ObjectStoreError, STATUS_TOO_MANY_REQUESTS, THROTTLE_CODES, TransferError};
pub use registry::{DefaultTransportFactory, TransportFactory, TransportRegistry};

/// Cancellation scope shared by every operation of a run.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    cancel: CancellationToken,
}

impl TransferContext {
    /// Creates a context that is never cancelled unless [`cancel`](Self::cancel) is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context driven by an existing token.
    #[must_use]
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Cancels the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails fast if the run has been cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] after cancellation.
    pub fn check(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `operation` unless the run is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`TransferError::Cancelled`].
    pub async fn run<T, F>(&self, operation: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, TransferError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = operation => result,
        }
    }
}

/// The four-operation transfer contract every backend implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Uploads one local file to `remote`.
    async fn upload_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError>;

    /// Downloads `remote` into the local file `local`.
    async fn download_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError>;

    /// Uploads the tree rooted at `local` below `remote`.
    async fn upload_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError>;

    /// Downloads everything below `remote` into the directory `local`.
    async fn download_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError>;
}

/// Creates the parent directory of `path`, if it has one.
pub(crate) async fn ensure_parent_dir(path: &Path) -> Result<(), TransferError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e)),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_run_returns_operation_result() {
        let ctx = TransferContext::new();
        let value = ctx.run(async { Ok::<_, TransferError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_aborts_pending_operation_on_cancel() {
        tokio::time::pause();
        let ctx = TransferContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, TransferError>(())
            })
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[test]
    fn test_check_after_cancel() {
        let ctx = TransferContext::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_ensure_parent_dir_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c.txt");
        ensure_parent_dir(&target).await.unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }
}
