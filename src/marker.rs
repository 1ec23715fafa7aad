//! Completion markers.
//!
//! A marker is an empty hidden file next to an entity's local path recording
//! that the `(local path, remote URL)` pair was already transferred in one
//! direction. Markers are never removed by the filer.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::debug;

use crate::manifest::{TransferDirection, TransferEntity};

/// Sentinel file for one entity and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarker {
    path: PathBuf,
}

impl CompletionMarker {
    /// Marker for `entity` transferred in `direction`.
    #[must_use]
    pub fn for_entity(entity: &TransferEntity, direction: TransferDirection) -> Self {
        Self::new(
            entity.local(),
            entity.remote.as_str(),
            entity.scheme().marker_label(),
            direction,
        )
    }

    /// Marker named `.<DIRECTION>-<SCHEME>-<md5(local + remote)>.finish` in
    /// the parent directory of `local`.
    #[must_use]
    pub fn new(local: &Path, remote: &str, scheme_label: &str, direction: TransferDirection) -> Self {
        let mut hasher = Md5::new();
        hasher.update(local.as_os_str().as_encoded_bytes());
        hasher.update(remote.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let name = format!(
            ".{}-{scheme_label}-{digest}.finish",
            direction.marker_label()
        );
        let parent = local.parent().unwrap_or_else(|| Path::new(""));
        Self {
            path: parent.join(name),
        }
    }

    /// Location of the marker file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the marker file exists.
    ///
    /// Errors other than "not found" are logged and treated as absent.
    pub async fn is_present(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => true,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %self.path.display(), error = %e, "unable to check completion marker");
                }
                false
            }
        }
    }

    /// Creates the marker file.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the file cannot be created.
    pub async fn write(&self) -> Result<(), std::io::Error> {
        tokio::fs::File::create(&self.path).await.map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{EntityRecord, Scheme};

    #[test]
    fn test_marker_name_encodes_direction_scheme_and_hash() {
        let marker = CompletionMarker::new(
            Path::new("/work/a.txt"),
            "file:///mnt/shared/a.txt",
            Scheme::File.marker_label(),
            TransferDirection::Download,
        );
        let expected = {
            let mut hasher = Md5::new();
            hasher.update(b"/work/a.txtfile:///mnt/shared/a.txt");
            hex::encode(hasher.finalize())
        };
        assert_eq!(
            marker.path(),
            Path::new(&format!("/work/.INPUTS-FILE-{expected}.finish"))
        );
    }

    #[test]
    fn test_marker_differs_by_direction() {
        let entity = TransferEntity::try_from(EntityRecord {
            url: "s3://b/k".to_string(),
            path: "/work/k".to_string(),
            kind: "file".to_string(),
            ..EntityRecord::default()
        })
        .unwrap();
        let down = CompletionMarker::for_entity(&entity, TransferDirection::Download);
        let up = CompletionMarker::for_entity(&entity, TransferDirection::Upload);
        assert_ne!(down, up);
        let name = up.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".OUTPUTS-S3-"), "{name}");
    }

    #[tokio::test]
    async fn test_marker_write_then_present() {
        let dir = tempfile::tempdir().unwrap();
        let marker = CompletionMarker::new(
            &dir.path().join("out.bin"),
            "s3://b/out.bin",
            "S3",
            TransferDirection::Upload,
        );
        assert!(!marker.is_present().await);
        marker.write().await.unwrap();
        assert!(marker.is_present().await);
    }
}
