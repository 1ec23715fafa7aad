//! Directory upload for backends without native recursive put.
//!
//! The local tree is walked once into an ordered upload plan, then each file
//! is sent through the backend's single-file upload. Symlinks are followed:
//! a link to a directory is walked as if it were one, a link to a file uploads
//! the target's bytes under the link's name, and dangling links are skipped.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use super::{TransferContext, TransferError, Transport};
use crate::manifest::RemoteUrl;

/// One file to upload and its `/`-separated path relative to the walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpload {
    /// File whose bytes are uploaded (symlinks already resolved).
    pub source: PathBuf,
    /// Remote-relative path, always `/`-separated.
    pub relative: String,
}

/// Walks `root` and returns the files to upload, sorted by relative path.
///
/// # Errors
///
/// Returns [`TransferError::Io`] for any unreadable directory or entry other
/// than entries that vanished mid-walk.
pub fn plan_upload_dir(root: &Path) -> Result<Vec<PlannedUpload>, TransferError> {
    let mut plan = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = stack.pop() {
        let canonical = fs::canonicalize(&dir).map_err(|e| TransferError::io(&dir, e))?;
        if !visited.insert(canonical) {
            debug!(dir = %dir.display(), "directory already walked, skipping symlink cycle");
            continue;
        }

        let entries = fs::read_dir(&dir).map_err(|e| TransferError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| TransferError::io(&dir, e))?;
            let path = entry.path();
            let relative = format!("{prefix}{}", entry.file_name().to_string_lossy());

            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(TransferError::io(&path, e)),
            };

            if metadata.is_dir() {
                stack.push((path, format!("{relative}/")));
            } else if metadata.is_symlink() {
                let target = resolve_link(&path)?;
                let target_metadata = match fs::metadata(&target) {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(link = %path.display(), "skipping dangling symlink");
                        continue;
                    }
                    Err(e) => return Err(TransferError::io(&target, e)),
                };
                if target_metadata.is_dir() {
                    stack.push((target, format!("{relative}/")));
                } else {
                    plan.push(PlannedUpload {
                        source: target,
                        relative,
                    });
                }
            } else {
                plan.push(PlannedUpload {
                    source: path,
                    relative,
                });
            }
        }
    }

    plan.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(plan)
}

/// Absolute target of a symlink, relative targets resolved against the link's directory.
fn resolve_link(link: &Path) -> Result<PathBuf, TransferError> {
    let target = fs::read_link(link).map_err(|e| TransferError::io(link, e))?;
    if target.is_absolute() {
        return Ok(target);
    }
    let base = link.parent().unwrap_or_else(|| Path::new("."));
    std::path::absolute(base.join(&target)).map_err(|e| TransferError::io(link, e))
}

/// Uploads the tree at `local` below `remote`, one file at a time.
///
/// # Errors
///
/// Returns the first planning or upload error.
#[instrument(skip_all, fields(backend = transport.name(), local = %local.display(), remote = %remote))]
pub async fn upload_dir_with<T>(
    transport: &T,
    ctx: &TransferContext,
    local: &Path,
    remote: &RemoteUrl,
) -> Result<(), TransferError>
where
    T: Transport + ?Sized,
{
    let root = local.to_path_buf();
    let plan = tokio::task::spawn_blocking(move || plan_upload_dir(&root)).await??;
    debug!(files = plan.len(), "directory upload planned");

    for item in plan {
        ctx.check()?;
        let target = remote.join(&item.relative);
        transport.upload_file(ctx, &item.source, &target).await?;
    }
    Ok(())
}
