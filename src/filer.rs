//! Run orchestration.
//!
//! [`Filer`] walks a [`TransferSet`] in manifest order. Every entity goes
//! through the same steps inside the mount retry policy:
//!
//! 1. skip if its completion marker exists
//! 2. for uploads, skip if the local source does not exist
//! 3. run the backend operation
//! 4. write the completion marker (failure is only logged)
//!
//! The first failing entity aborts the run.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::config::FilerConfig;
use crate::error::FilerError;
use crate::manifest::{
    EntityKind, TransferDirection, TransferEntity, TransferMode, TransferSet, load_transfer_set,
};
use crate::marker::CompletionMarker;
use crate::retry::MountRetryPolicy;
use crate::transport::{
    DefaultTransportFactory, TransferContext, TransferError, TransportFactory, TransportRegistry,
};

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Entities moved by a backend.
    pub transferred: usize,
    /// Entities skipped because their completion marker existed.
    pub skipped_completed: usize,
    /// Outputs skipped because the local source was absent.
    pub skipped_missing: usize,
}

impl TransferStats {
    /// Total number of entities visited.
    #[must_use]
    pub fn total(&self) -> usize {
        self.transferred + self.skipped_completed + self.skipped_missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Transferred,
    AlreadyCompleted,
    MissingSource,
}

/// One invocation's worth of transfers.
#[derive(Debug)]
pub struct Filer {
    set: TransferSet,
    registry: TransportRegistry,
    retry: MountRetryPolicy,
    ctx: TransferContext,
}

impl Filer {
    /// Creates a filer over an already parsed set.
    #[must_use]
    pub fn new(set: TransferSet, factory: Arc<dyn TransportFactory>, retry: MountRetryPolicy) -> Self {
        Self {
            set,
            registry: TransportRegistry::new(factory),
            retry,
            ctx: TransferContext::new(),
        }
    }

    /// Reads the manifest at `path` and wires transports from `config`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`load_transfer_set`].
    pub async fn build_from_file(
        path: &Path,
        mode: TransferMode,
        config: FilerConfig,
    ) -> Result<Self, FilerError> {
        let set = load_transfer_set(path, mode, config.offload).await?;
        let retry = MountRetryPolicy::new(config.mount_retry);
        Ok(Self::new(
            set,
            Arc::new(DefaultTransportFactory::new(config)),
            retry,
        ))
    }

    /// Replaces the cancellation context.
    #[must_use]
    pub fn with_transfer_context(mut self, ctx: TransferContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// The parsed unit of work.
    #[must_use]
    pub fn transfer_set(&self) -> &TransferSet {
        &self.set
    }

    /// Runs every transfer of the selected mode.
    ///
    /// In [`TransferMode::All`] all inputs complete before any output starts,
    /// and a failed input means no output is attempted.
    ///
    /// # Errors
    ///
    /// Returns the first entity failure, or [`FilerError::Cancelled`].
    #[instrument(skip_all, fields(mode = %self.set.mode))]
    pub async fn transfer(&self) -> Result<TransferStats, FilerError> {
        let mut stats = TransferStats::default();
        if matches!(self.set.mode, TransferMode::Inputs | TransferMode::All) {
            self.transfer_all(&self.set.inputs, TransferDirection::Download, &mut stats)
                .await?;
        }
        if matches!(self.set.mode, TransferMode::Outputs | TransferMode::All) {
            self.transfer_all(&self.set.outputs, TransferDirection::Upload, &mut stats)
                .await?;
        }
        info!(
            transferred = stats.transferred,
            skipped_completed = stats.skipped_completed,
            skipped_missing = stats.skipped_missing,
            "all transfers finished"
        );
        Ok(stats)
    }

    async fn transfer_all(
        &self,
        entities: &[TransferEntity],
        direction: TransferDirection,
        stats: &mut TransferStats,
    ) -> Result<(), FilerError> {
        for entity in entities {
            if self.ctx.is_cancelled() {
                return Err(FilerError::Cancelled);
            }
            let outcome = self
                .retry
                .run(|| self.transfer_entity(entity, direction))
                .await?;
            match outcome {
                Outcome::Transferred => stats.transferred += 1,
                Outcome::AlreadyCompleted => stats.skipped_completed += 1,
                Outcome::MissingSource => stats.skipped_missing += 1,
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(name = %entity.name, remote = %entity.remote, local = %entity.local().display(), ?direction))]
    async fn transfer_entity(
        &self,
        entity: &TransferEntity,
        direction: TransferDirection,
    ) -> Result<Outcome, FilerError> {
        let marker = CompletionMarker::for_entity(entity, direction);
        if marker.is_present().await {
            info!(marker = %marker.path().display(), "already transferred, skipping");
            return Ok(Outcome::AlreadyCompleted);
        }

        if direction == TransferDirection::Upload {
            match tokio::fs::metadata(entity.local()).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("output does not exist locally, skipping");
                    return Ok(Outcome::MissingSource);
                }
                Err(e) => {
                    return Err(FilerError::internal(
                        "stat output",
                        TransferError::io(entity.local(), e),
                    ));
                }
            }
        }

        let transport = self
            .registry
            .get(entity.scheme(), entity.remote.credentials())
            .await?;
        info!(backend = transport.name(), kind = %entity.kind, "transfer started");
        let started = Instant::now();

        let ctx = &self.ctx;
        let (local, remote) = (entity.local(), &entity.remote);
        let result = match (direction, entity.kind) {
            (TransferDirection::Download, EntityKind::File) => {
                transport.download_file(ctx, local, remote).await
            }
            (TransferDirection::Download, EntityKind::Directory) => {
                transport.download_dir(ctx, local, remote).await
            }
            (TransferDirection::Upload, EntityKind::File) => {
                transport.upload_file(ctx, local, remote).await
            }
            (TransferDirection::Upload, EntityKind::Directory) => {
                transport.upload_dir(ctx, local, remote).await
            }
        };
        result.map_err(|e| {
            let verb = match direction {
                TransferDirection::Download => "download",
                TransferDirection::Upload => "upload",
            };
            FilerError::internal(format!("{verb} {}", entity.remote), e)
        })?;

        info!(
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "transfer finished"
        );
        if let Err(e) = marker.write().await {
            warn!(marker = %marker.path().display(), error = %e, "failed to write completion marker");
        }
        Ok(Outcome::Transferred)
    }
}
