//! Resumable multipart state persisted next to the local file.
//!
//! A checkpoint is only honored when it describes the same object and the
//! same local file layout; anything else starts the transfer over.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::TransferError;

/// Which way the checkpointed transfer goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Multipart upload.
    Upload,
    /// Ranged multipart download.
    Download,
}

impl CheckpointKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// Location of the checkpoint for `local` and `bucket/key`.
#[must_use]
pub fn checkpoint_path(local: &Path, bucket: &str, key: &str, kind: CheckpointKind) -> PathBuf {
    let digest = hex::encode(Md5::digest(format!("{bucket}/{key}").as_bytes()));
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    local.with_file_name(format!(".{name}.{}.{}.cp", &digest[..8], kind.suffix()))
}

/// State of an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    /// Target bucket.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Local file size when the upload started.
    pub file_size: u64,
    /// Local modification time (Unix seconds) when the upload started.
    pub modified_secs: u64,
    /// Part size the parts were cut with.
    pub part_size: u64,
    /// Provider-assigned multipart upload id.
    pub upload_id: String,
    /// Completed part numbers and their entity tags.
    pub parts: BTreeMap<i32, String>,
}

impl UploadCheckpoint {
    /// True when this checkpoint can resume an upload with the given parameters.
    #[must_use]
    pub fn matches(&self, bucket: &str, key: &str, stamp: FileStamp, part_size: u64) -> bool {
        self.bucket == bucket
            && self.key == key
            && self.file_size == stamp.size
            && self.modified_secs == stamp.modified_secs
            && self.part_size == part_size
    }
}

/// State of an in-progress ranged download into a temporary file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCheckpoint {
    /// Source bucket.
    pub bucket: String,
    /// Source key.
    pub key: String,
    /// Object size from `HeadObject`.
    pub object_size: u64,
    /// Entity tag from `HeadObject`; a changed tag invalidates the checkpoint.
    pub etag: Option<String>,
    /// Part size the ranges were cut with.
    pub part_size: u64,
    /// Completed part numbers.
    pub parts: Vec<i32>,
}

impl DownloadCheckpoint {
    /// True when this checkpoint can resume a download of the given object.
    #[must_use]
    pub fn matches(&self, bucket: &str, key: &str, size: u64, etag: Option<&str>, part_size: u64) -> bool {
        self.bucket == bucket
            && self.key == key
            && self.object_size == size
            && self.etag.as_deref() == etag
            && self.part_size == part_size
    }
}

/// Size and modification time identifying a local file version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// Length in bytes.
    pub size: u64,
    /// Modification time in Unix seconds, 0 when unavailable.
    pub modified_secs: u64,
}

impl FileStamp {
    /// Reads the stamp of `path`.
    pub async fn of(path: &Path) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        let modified_secs = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_secs());
        Ok(Self {
            size: metadata.len(),
            modified_secs,
        })
    }
}

/// Loads a checkpoint, treating an absent or unreadable one as none.
pub async fn load<T>(path: &Path) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt checkpoint");
            None
        }
    }
}

/// Writes a checkpoint atomically (temp file then rename).
pub async fn save<T: Serialize>(path: &Path, checkpoint: &T) -> Result<(), TransferError> {
    let raw = serde_json::to_vec(checkpoint)
        .map_err(|e| TransferError::io(path, std::io::Error::other(e)))?;
    let temp = path.with_extension("cp.tmp");
    tokio::fs::write(&temp, raw)
        .await
        .map_err(|e| TransferError::io(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| TransferError::io(path, e))
}

/// Removes a checkpoint; a missing file is fine.
pub async fn remove(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "checkpoint removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove checkpoint"),
    }
}
