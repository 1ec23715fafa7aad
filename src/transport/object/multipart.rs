//! Checkpointed multipart upload and ranged multipart download.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use futures_util::StreamExt;
use futures_util::stream;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::checkpoint::{
    self, CheckpointKind, DownloadCheckpoint, FileStamp, UploadCheckpoint, checkpoint_path,
};
use super::{ObjectStoreTransport, client, part_count, temp_path};
use crate::transport::TransferError;

/// Provider error code for an upload id that no longer exists.
const NO_SUCH_UPLOAD: &str = "NoSuchUpload";

/// Byte range `[start, end)` of 1-based part `number`.
fn part_range(number: i32, part_size: u64, total: u64) -> (u64, u64) {
    let index = u64::try_from(number - 1).unwrap_or_default();
    let start = index * part_size;
    (start, (start + part_size).min(total))
}

fn part_numbers(local: &Path, total: u64, part_size: u64) -> Result<Vec<i32>, TransferError> {
    let count = i32::try_from(part_count(total, part_size))
        .map_err(|_| TransferError::too_large(local, total))?;
    Ok((1..=count).collect())
}

fn is_no_such_upload(err: &TransferError) -> bool {
    err.as_object_store()
        .and_then(|e| e.code.as_deref())
        .is_some_and(|code| code == NO_SUCH_UPLOAD)
}

impl ObjectStoreTransport {
    /// Uploads `local` in parts, resuming from a matching checkpoint.
    ///
    /// When the provider no longer knows the checkpointed upload id, the
    /// checkpoint is dropped and one fresh upload is started.
    pub(super) async fn upload_multipart(
        &self,
        local: &Path,
        bucket: &str,
        key: &str,
        stamp: FileStamp,
        part_size: u64,
    ) -> Result<(), TransferError> {
        let cp_path = checkpoint_path(local, bucket, key, CheckpointKind::Upload);
        let resumed = match checkpoint::load::<UploadCheckpoint>(&cp_path).await {
            Some(cp) if cp.matches(bucket, key, stamp, part_size) => {
                info!(completed = cp.parts.len(), "resuming multipart upload");
                Some(cp)
            }
            _ => None,
        };
        let was_resumed = resumed.is_some();

        let result = self
            .upload_parts(local, &cp_path, bucket, key, stamp, part_size, resumed)
            .await;
        match result {
            Err(err) if is_no_such_upload(&err) => {
                checkpoint::remove(&cp_path).await;
                if !was_resumed {
                    return Err(err);
                }
                warn!("checkpointed upload id is gone, starting a fresh multipart upload");
                let retry = self
                    .upload_parts(local, &cp_path, bucket, key, stamp, part_size, None)
                    .await;
                if retry.as_ref().is_err_and(is_no_such_upload) {
                    checkpoint::remove(&cp_path).await;
                }
                retry
            }
            other => other,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        local: &Path,
        cp_path: &Path,
        bucket: &str,
        key: &str,
        stamp: FileStamp,
        part_size: u64,
        resumed: Option<UploadCheckpoint>,
    ) -> Result<(), TransferError> {
        let mut cp = if let Some(cp) = resumed {
            cp
        } else {
            let upload_id = Self::observe(
                &self.upload_rate,
                self.client.create_multipart(bucket, key).await,
            )?;
            debug!(upload_id = %upload_id, "multipart upload created");
            UploadCheckpoint {
                bucket: bucket.to_string(),
                key: key.to_string(),
                file_size: stamp.size,
                modified_secs: stamp.modified_secs,
                part_size,
                upload_id,
                parts: BTreeMap::new(),
            }
        };
        checkpoint::save(cp_path, &cp).await?;

        let upload_id = cp.upload_id.clone();
        let pending = part_numbers(local, stamp.size, part_size)?
            .into_iter()
            .filter(|number| !cp.parts.contains_key(number))
            .collect::<Vec<_>>();
        debug!(pending = pending.len(), "uploading parts");

        let mut uploads = stream::iter(pending)
            .map(|number| self.upload_part(local, bucket, key, &upload_id, number, part_size, stamp.size))
            .buffer_unordered(self.task_num);
        while let Some(result) = uploads.next().await {
            let (number, etag) = result?;
            cp.parts.insert(number, etag);
            checkpoint::save(cp_path, &cp).await?;
        }
        drop(uploads);

        let parts = cp
            .parts
            .iter()
            .map(|(number, etag)| (*number, etag.clone()))
            .collect::<Vec<_>>();
        Self::observe(
            &self.upload_rate,
            self.client
                .complete_multipart(bucket, key, &upload_id, &parts)
                .await,
        )?;
        checkpoint::remove(cp_path).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part(
        &self,
        local: &Path,
        bucket: &str,
        key: &str,
        upload_id: &str,
        number: i32,
        part_size: u64,
        total: u64,
    ) -> Result<(i32, String), TransferError> {
        let (start, end) = part_range(number, part_size, total);
        let body = client::file_body(local, start, end - start).await?;

        Self::pace(&self.upload_rate, end - start).await;
        let etag = Self::observe(
            &self.upload_rate,
            self.client
                .upload_part(bucket, key, upload_id, number, body)
                .await,
        )?;
        debug!(part = number, bytes = end - start, "part uploaded");
        Ok((number, etag))
    }

    pub(super) async fn download_multipart(
        &self,
        local: &Path,
        bucket: &str,
        key: &str,
        size: u64,
        etag: Option<String>,
    ) -> Result<(), TransferError> {
        let temp = temp_path(local);
        let cp_path = checkpoint_path(local, bucket, key, CheckpointKind::Download);
        let part_size = self.part_size;

        let resumable = match checkpoint::load::<DownloadCheckpoint>(&cp_path).await {
            Some(cp)
                if cp.matches(bucket, key, size, etag.as_deref(), part_size)
                    && tokio::fs::try_exists(&temp).await.unwrap_or(false) =>
            {
                Some(cp)
            }
            _ => None,
        };
        let mut cp = if let Some(cp) = resumable {
            info!(completed = cp.parts.len(), "resuming multipart download");
            cp
        } else {
            let file = File::create(&temp)
                .await
                .map_err(|e| TransferError::io(&temp, e))?;
            file.set_len(size)
                .await
                .map_err(|e| TransferError::io(&temp, e))?;
            DownloadCheckpoint {
                bucket: bucket.to_string(),
                key: key.to_string(),
                object_size: size,
                etag,
                part_size,
                parts: Vec::new(),
            }
        };
        checkpoint::save(&cp_path, &cp).await?;

        let pending = part_numbers(local, size, part_size)?
            .into_iter()
            .filter(|number| !cp.parts.contains(number))
            .collect::<Vec<_>>();
        debug!(pending = pending.len(), "downloading parts");

        let mut downloads = stream::iter(pending)
            .map(|number| self.download_part(&temp, bucket, key, number, part_size, size))
            .buffer_unordered(self.task_num);
        while let Some(result) = downloads.next().await {
            cp.parts.push(result?);
            checkpoint::save(&cp_path, &cp).await?;
        }
        drop(downloads);

        tokio::fs::rename(&temp, local)
            .await
            .map_err(|e| TransferError::io(local, e))?;
        checkpoint::remove(&cp_path).await;
        Ok(())
    }

    async fn download_part(
        &self,
        temp: &Path,
        bucket: &str,
        key: &str,
        number: i32,
        part_size: u64,
        total: u64,
    ) -> Result<i32, TransferError> {
        let (start, end) = part_range(number, part_size, total);
        let mut body = Self::observe(
            &self.download_rate,
            self.client.get(bucket, key, Some((start, end - 1))).await,
        )?;

        let mut file = OpenOptions::new()
            .write(true)
            .open(temp)
            .await
            .map_err(|e| TransferError::io(temp, e))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| TransferError::io(temp, e))?;
        let mut writer = BufWriter::new(file);
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = Self::observe(
                &self.download_rate,
                chunk.map_err(|e| client::body_error(bucket, key, &e)),
            )?;
            Self::pace(&self.download_rate, chunk.len() as u64).await;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(temp, e))?;
            written += chunk.len() as u64;
        }
        writer.flush().await.map_err(|e| TransferError::io(temp, e))?;

        if written != end - start {
            return Err(TransferError::integrity(
                temp,
                format!("part {number}: expected {} bytes, got {written}", end - start),
            ));
        }
        debug!(part = number, bytes = written, "part downloaded");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_range_last_part_is_short() {
        assert_eq!(part_range(1, 10, 25), (0, 10));
        assert_eq!(part_range(2, 10, 25), (10, 20));
        assert_eq!(part_range(3, 10, 25), (20, 25));
    }

    #[test]
    fn test_part_numbers_cover_file() {
        let numbers = part_numbers(Path::new("/f"), 25, 10).unwrap_or_default();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
