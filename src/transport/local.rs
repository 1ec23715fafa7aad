//! Local-mount backend.
//!
//! Remote paths name locations on the node (host view). They are mapped into
//! this container by replacing the host base path with the container base
//! path. Downloads become symlinks to the mapped location; uploads copy bytes
//! into it.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{TransferContext, TransferError, Transport, ensure_parent_dir};
use crate::config::LocalMountConfig;
use crate::manifest::RemoteUrl;

/// Symlink/copy transport over a shared mount.
#[derive(Debug, Clone)]
pub struct LocalMountTransport {
    host_base: PathBuf,
    container_base: PathBuf,
    passthrough_roots: Vec<String>,
}

impl LocalMountTransport {
    /// Creates the transport from its mapping configuration.
    #[must_use]
    pub fn new(config: &LocalMountConfig) -> Self {
        Self {
            host_base: normalize(&config.host_base_path),
            container_base: config.container_base_path.clone(),
            passthrough_roots: config.passthrough_roots.clone(),
        }
    }

    /// Maps a remote path to its location inside this container.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRemote`] when the path is neither under
    /// a passthrough root nor under the host base path, or climbs out of a
    /// passthrough root with `..`.
    pub fn container_path(&self, remote: &RemoteUrl) -> Result<PathBuf, TransferError> {
        let raw = remote.path();
        if self
            .passthrough_roots
            .iter()
            .any(|root| raw.starts_with(root.as_str()))
        {
            if Path::new(raw)
                .components()
                .any(|component| component == Component::ParentDir)
            {
                return Err(TransferError::invalid_remote(
                    remote.redacted(),
                    "`..` is not allowed below a mount root",
                ));
            }
            return Ok(PathBuf::from(raw));
        }

        let requested = normalize(Path::new(raw));
        if self.host_base.as_os_str().is_empty() || !self.host_base.is_absolute() {
            return Err(TransferError::invalid_remote(
                remote.redacted(),
                "host base path is not configured",
            ));
        }
        let relative = requested.strip_prefix(&self.host_base).map_err(|_| {
            TransferError::invalid_remote(
                remote.redacted(),
                format!("not a descendant of host base path {}", self.host_base.display()),
            )
        })?;
        Ok(self.container_base.join(relative))
    }

    async fn link(&self, ctx: &TransferContext, local: &Path, remote: &RemoteUrl) -> Result<(), TransferError> {
        let target = self.container_path(remote)?;
        tokio::fs::metadata(&target)
            .await
            .map_err(|e| TransferError::io(&target, e))?;

        if let Ok(existing) = tokio::fs::read_link(local).await
            && existing == target
        {
            debug!(local = %local.display(), "symlink already in place");
            return Ok(());
        }

        ensure_parent_dir(local).await?;
        info!(target = %target.display(), local = %local.display(), "symlinking");
        ctx.run(async {
            tokio::fs::symlink(&target, local)
                .await
                .map_err(|e| TransferError::io(local, e))
        })
        .await
    }
}

#[async_trait]
impl Transport for LocalMountTransport {
    fn name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn upload_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let target = self.container_path(remote)?;
        info!(target = %target.display(), "copying file");
        let source = local.to_path_buf();
        ctx.run(async move {
            tokio::task::spawn_blocking(move || copy_file(&source, &target)).await?
        })
        .await
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn download_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        self.link(ctx, local, remote).await
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn upload_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let target = self.container_path(remote)?;
        info!(target = %target.display(), "copying directory");
        let source = local.to_path_buf();
        ctx.run(async move {
            tokio::task::spawn_blocking(move || copy_tree(&source, &target)).await?
        })
        .await
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn download_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        self.link(ctx, local, remote).await
    }
}

/// Lexically resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.dev() == b.dev() && a.ino() == b.ino()
}

fn copy_file(source: &Path, target: &Path) -> Result<(), TransferError> {
    let source_meta = fs::metadata(source).map_err(|e| TransferError::io(source, e))?;
    if let Ok(target_meta) = fs::metadata(target)
        && same_file(&source_meta, &target_meta)
    {
        debug!(source = %source.display(), "source and target are the same file");
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
    }
    fs::copy(source, target).map_err(|e| TransferError::io(target, e))?;
    fs::File::open(target)
        .and_then(|file| file.sync_all())
        .map_err(|e| TransferError::io(target, e))
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), TransferError> {
    fs::create_dir_all(target).map_err(|e| TransferError::io(target, e))?;
    let entries = fs::read_dir(source)
        .map_err(|e| TransferError::io(source, e))?
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|e| TransferError::io(source, e))?;

    for entry in entries {
        let from = entry.path();
        let to = target.join(entry.file_name());
        let metadata = fs::metadata(&from).map_err(|e| TransferError::io(&from, e))?;
        if metadata.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            copy_file(&from, &to)?;
        }
    }
    Ok(())
}
