//! Retry wrapper for remotes reached through a mounted filesystem.
//!
//! When object storage is mounted, provider throttling reaches the filer as a
//! generic `EIO` from the mount. [`MountRetryPolicy`] retries such failures
//! with randomized exponential backoff and passes everything else through.
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(base_delay * 2^(attempt - 1), max_delay) + random(0..max_jitter)
//! ```

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::FilerError;

/// Attempts made before the last error is surfaced.
pub const MOUNT_RETRY_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_JITTER: Duration = Duration::from_secs(5);

/// Retry policy for mount-layer I/O failures.
#[derive(Debug, Clone)]
pub struct MountRetryPolicy {
    enabled: bool,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl MountRetryPolicy {
    /// Creates the policy. A disabled policy runs the operation exactly once.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            max_attempts: MOUNT_RETRY_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            max_jitter: MAX_JITTER,
        }
    }

    /// Returns whether retries are enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Backoff before retry number `attempt` (1-indexed), without jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// Runs `operation`, retrying mount-layer I/O failures.
    ///
    /// # Errors
    ///
    /// Returns the operation's error when it is not retryable or the attempt
    /// budget is spent.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, FilerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FilerError>>,
    {
        if !self.enabled {
            return operation().await;
        }

        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && is_mount_io_error(&error) => {
                    let delay = self.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "mount I/O error, possibly provider throttling; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    debug!(attempt, "not retrying");
                    return Err(error);
                }
            }
        }
    }
}

/// True if the error chain contains an I/O error with errno `EIO`.
#[must_use]
pub fn is_mount_io_error(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>()
            && io.raw_os_error() == Some(libc::EIO)
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::transport::TransferError;

    fn eio() -> FilerError {
        FilerError::internal(
            "download /work/a",
            TransferError::io("/work/a", std::io::Error::from_raw_os_error(libc::EIO)),
        )
    }

    fn enoent() -> FilerError {
        FilerError::internal(
            "download /work/a",
            TransferError::io("/work/a", std::io::Error::from_raw_os_error(libc::ENOENT)),
        )
    }

    #[test]
    fn test_is_mount_io_error_walks_source_chain() {
        assert!(is_mount_io_error(&eio()));
        assert!(!is_mount_io_error(&enoent()));
        assert!(!is_mount_io_error(&FilerError::Cancelled));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = MountRetryPolicy::new(true);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_disabled_policy_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = MountRetryPolicy::new(false)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(eio()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eio_is_retried_up_to_budget() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = MountRetryPolicy::new(true)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(eio()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MOUNT_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = MountRetryPolicy::new(true)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(enoent()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_eio() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let result = MountRetryPolicy::new(true)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(eio()) } else { Ok(n) } }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
    }
}
