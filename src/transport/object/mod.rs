//! Object storage backend (generic S3 and the vendor flavor).
//!
//! Both flavors speak the S3-compatible API. They differ in how a directory
//! download walks the bucket and in which failures count as throttling:
//!
//! - generic: one flat listing of every key under the prefix; only a
//!   throttle response (429 or a vendor throttle code) is retried
//! - vendor: a delimited listing walked level by level; a failure is also
//!   retried when every error the rate controller saw during the attempt was a
//!   throttle signal
//!
//! Throttled operations are retried in place without limit while the rate
//! controller halves bandwidth. Files at or above the part size go through
//! checkpointed multipart transfer (see [`checkpoint`]).

pub mod checkpoint;
pub mod client;
mod multipart;

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_credential_types::provider::SharedCredentialsProvider;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use self::client::{ListPage, ObjectClient};
use super::{ObjectStoreError, TransferContext, TransferError, Transport, ensure_parent_dir, walk};
use crate::bandwidth::AdaptiveRateController;
use crate::config::{DEFAULT_MAX_BANDWIDTH, ObjectStoreConfig};
use crate::manifest::{RemoteUrl, ensure_trailing_slash};

/// Maximum number of parts in one multipart upload.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Maximum size of one part.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Granularity at which transferred bytes are charged to the rate controller.
pub const RATE_CHUNK_BYTES: u64 = 1024 * 1024;

/// Picks the part size for a multipart upload of `file_size` bytes.
///
/// Starts at `default` and doubles until the file fits in
/// [`MAX_PART_COUNT`] parts, capped at [`MAX_PART_SIZE`]. Returns `None` when
/// even the largest part size cannot hold the file.
#[must_use]
pub fn part_size(file_size: u64, default: u64) -> Option<u64> {
    let minimum = file_size.saturating_sub(1) / MAX_PART_COUNT + 1;
    if minimum > MAX_PART_SIZE {
        return None;
    }
    let mut size = default.max(1);
    loop {
        if minimum <= size {
            return Some(size);
        }
        size = size.saturating_mul(2);
        if size > MAX_PART_SIZE {
            return Some(MAX_PART_SIZE);
        }
    }
}

/// Number of `part_size` parts needed for `total` bytes.
fn part_count(total: u64, part_size: u64) -> u64 {
    total.div_ceil(part_size.max(1))
}

/// Which provider dialect a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFlavor {
    /// Generic S3.
    Generic,
    /// Vendor object storage.
    Vendor,
}

impl ObjectFlavor {
    /// Short name for logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Generic => "s3",
            Self::Vendor => "tos",
        }
    }
}

/// Object storage transport with per-direction adaptive rate control.
#[derive(Debug)]
pub struct ObjectStoreTransport {
    client: ObjectClient,
    flavor: ObjectFlavor,
    part_size: u64,
    task_num: usize,
    upload_rate: AdaptiveRateController,
    download_rate: AdaptiveRateController,
}

impl ObjectStoreTransport {
    /// Builds the transport and its SDK client.
    #[must_use]
    pub fn new(
        config: &ObjectStoreConfig,
        credentials: SharedCredentialsProvider,
        flavor: ObjectFlavor,
    ) -> Self {
        let ceiling = match (flavor, config.max_bandwidth) {
            (ObjectFlavor::Generic, 0) => DEFAULT_MAX_BANDWIDTH,
            (_, ceiling) => ceiling,
        };
        info!(
            flavor = flavor.name(),
            part_size = config.part_size,
            task_num = config.task_num,
            ceiling,
            "object storage transport created"
        );
        Self {
            client: ObjectClient::new(config, credentials),
            flavor,
            part_size: config.part_size,
            task_num: config.task_num.max(1),
            upload_rate: AdaptiveRateController::new("upload", ceiling, ceiling),
            download_rate: AdaptiveRateController::new("download", ceiling, ceiling),
        }
    }

    /// The provider dialect.
    #[must_use]
    pub fn flavor(&self) -> ObjectFlavor {
        self.flavor
    }

    /// Reports a failed result to `rate` and passes it through.
    fn observe<T>(
        rate: &AdaptiveRateController,
        result: Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        if let Err(err) = &result {
            rate.on_error(err);
        }
        result
    }

    /// Charges `bytes` to `rate` in [`RATE_CHUNK_BYTES`] slices.
    async fn pace(rate: &AdaptiveRateController, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(RATE_CHUNK_BYTES);
            rate.acquire(chunk).await;
            remaining -= chunk;
        }
    }

    fn absorbs(&self, rate: &AdaptiveRateController, err: &TransferError) -> bool {
        if err.as_object_store().is_some_and(ObjectStoreError::is_throttle) {
            return true;
        }
        self.flavor == ObjectFlavor::Vendor && rate.only_throttled()
    }

    /// Runs `attempt` until it succeeds or fails with something other than throttling.
    async fn throttled<T, F, Fut>(
        &self,
        rate: &AdaptiveRateController,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        loop {
            rate.begin_attempt();
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if self.absorbs(rate, &err) => {
                    warn!(
                        operation,
                        bandwidth = rate.bandwidth(),
                        error = %err,
                        "throttled by provider, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn upload_object(&self, local: &Path, bucket: &str, key: &str) -> Result<(), TransferError> {
        let stamp = checkpoint::FileStamp::of(local).await?;
        if stamp.size < self.part_size {
            debug!(size = stamp.size, part_size = self.part_size, "single request upload");
            let body = client::file_body(local, 0, stamp.size).await?;
            Self::pace(&self.upload_rate, stamp.size).await;
            return Self::observe(&self.upload_rate, self.client.put(bucket, key, body).await);
        }

        let part = part_size(stamp.size, self.part_size)
            .ok_or_else(|| TransferError::too_large(local, stamp.size))?;
        debug!(size = stamp.size, part_size = part, "multipart upload");
        self.upload_multipart(local, bucket, key, stamp, part).await
    }

    async fn download_object(&self, local: &Path, bucket: &str, key: &str) -> Result<(), TransferError> {
        ensure_parent_dir(local).await?;
        self.throttled(&self.download_rate, "download", || async move {
            let head = Self::observe(&self.download_rate, self.client.head(bucket, key).await)?;
            match head.size {
                Some(size) if size >= self.part_size => {
                    self.download_multipart(local, bucket, key, size, head.etag).await
                }
                _ => self.download_single(local, bucket, key).await,
            }
        })
        .await
    }

    async fn download_single(&self, local: &Path, bucket: &str, key: &str) -> Result<(), TransferError> {
        let temp = temp_path(local);
        let mut body = Self::observe(&self.download_rate, self.client.get(bucket, key, None).await)?;
        let file = File::create(&temp)
            .await
            .map_err(|e| TransferError::io(&temp, e))?;
        let mut writer = BufWriter::new(file);
        while let Some(chunk) = body.next().await {
            let chunk = Self::observe(
                &self.download_rate,
                chunk.map_err(|e| client::body_error(bucket, key, &e)),
            )?;
            Self::pace(&self.download_rate, chunk.len() as u64).await;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(&temp, e))?;
        }
        writer.flush().await.map_err(|e| TransferError::io(&temp, e))?;
        tokio::fs::rename(&temp, local)
            .await
            .map_err(|e| TransferError::io(local, e))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<String>,
    ) -> Result<ListPage, TransferError> {
        self.throttled(&self.download_rate, "list", || {
            let token = token.clone();
            async move {
                Self::observe(
                    &self.download_rate,
                    self.client.list_page(bucket, prefix, delimiter, token).await,
                )
            }
        })
        .await
    }

    /// Mirrors every key under `prefix` below `local`, keeping relative layout.
    async fn download_prefix_flat(
        &self,
        ctx: &TransferContext,
        local: &Path,
        bucket: &str,
        prefix: &str,
    ) -> Result<(), TransferError> {
        let prefix = ensure_trailing_slash(prefix);
        let mut token = None;
        loop {
            let page = self.list(bucket, &prefix, None, token.take()).await?;
            for key in &page.keys {
                ctx.check()?;
                if key.ends_with('/') {
                    continue;
                }
                let Some(relative) = relative_key(&prefix, key) else {
                    warn!(key = %key, "skipping key that escapes the prefix");
                    continue;
                };
                self.download_object(&local.join(relative), bucket, key).await?;
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Walks the prefix one level at a time: files first, then each sub-prefix.
    async fn download_prefix_delimited(
        &self,
        ctx: &TransferContext,
        local: &Path,
        bucket: &str,
        prefix: &str,
    ) -> Result<(), TransferError> {
        let mut pending = vec![(ensure_trailing_slash(prefix), local.to_path_buf())];
        while let Some((prefix, dir)) = pending.pop() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| TransferError::io(&dir, e))?;

            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            let mut token = None;
            loop {
                let page = self.list(bucket, &prefix, Some("/"), token.take()).await?;
                files.extend(page.keys.into_iter().filter(|key| !key.ends_with('/')));
                subdirs.extend(page.prefixes);
                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }

            for key in files {
                ctx.check()?;
                let Some(name) = leaf_name(&key) else {
                    warn!(key = %key, "skipping key with unusable name");
                    continue;
                };
                self.download_object(&dir.join(name), bucket, &key).await?;
            }
            for sub in subdirs.into_iter().rev() {
                if let Some(name) = leaf_name(sub.trim_end_matches('/')) {
                    let target = dir.join(name);
                    pending.push((sub, target));
                }
            }
        }
        Ok(())
    }
}

/// Temporary download path next to `local`.
fn temp_path(local: &Path) -> PathBuf {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    local.with_file_name(format!("{name}.part"))
}

/// `key` relative to `prefix` as a safe local relative path.
fn relative_key(prefix: &str, key: &str) -> Option<PathBuf> {
    let relative = key.strip_prefix(prefix)?;
    let mut path = PathBuf::new();
    for segment in relative.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment == ".." {
            return None;
        }
        path.push(segment);
    }
    (!path.as_os_str().is_empty()).then_some(path)
}

/// Last `/`-separated segment, unless it is empty or `..`.
fn leaf_name(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next()?;
    (!name.is_empty() && name != "." && name != "..").then_some(name)
}

fn bucket_and_key(remote: &RemoteUrl, allow_empty_key: bool) -> Result<(&str, &str), TransferError> {
    if remote.host().is_empty() {
        return Err(TransferError::invalid_remote(remote.redacted(), "missing bucket"));
    }
    if !allow_empty_key && remote.path().is_empty() {
        return Err(TransferError::invalid_remote(remote.redacted(), "missing object key"));
    }
    Ok((remote.host(), remote.path()))
}

#[async_trait]
impl Transport for ObjectStoreTransport {
    fn name(&self) -> &'static str {
        self.flavor.name()
    }

    #[instrument(skip_all, fields(flavor = self.flavor.name(), local = %local.display(), remote = %remote))]
    async fn upload_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let (bucket, key) = bucket_and_key(remote, false)?;
        ctx.run(self.throttled(&self.upload_rate, "upload", || {
            self.upload_object(local, bucket, key)
        }))
        .await?;
        info!("uploaded");
        Ok(())
    }

    #[instrument(skip_all, fields(flavor = self.flavor.name(), local = %local.display(), remote = %remote))]
    async fn download_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let (bucket, key) = bucket_and_key(remote, false)?;
        ctx.run(self.download_object(local, bucket, key)).await?;
        info!("downloaded");
        Ok(())
    }

    async fn upload_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        walk::upload_dir_with(self, ctx, local, remote).await
    }

    #[instrument(skip_all, fields(flavor = self.flavor.name(), local = %local.display(), remote = %remote))]
    async fn download_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let (bucket, prefix) = bucket_and_key(remote, true)?;
        let walk = async {
            match self.flavor {
                ObjectFlavor::Generic => self.download_prefix_flat(ctx, local, bucket, prefix).await,
                ObjectFlavor::Vendor => {
                    self.download_prefix_delimited(ctx, local, bucket, prefix).await
                }
            }
        };
        ctx.run(walk).await
    }
}
