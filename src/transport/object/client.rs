//! Thin wrapper over the S3 SDK client.
//!
//! Every call flattens SDK failures into [`ObjectStoreError`] so the rate
//! controller and the throttle loop can inspect status and error code without
//! knowing the SDK's per-operation error types.

use std::path::Path;

use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{
    BehaviorVersion, Region, RequestChecksumCalculation, ResponseChecksumValidation,
    StalledStreamProtectionConfig,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::transport::{ObjectStoreError, TransferError};

/// Signing region used when the config leaves it empty.
pub const FALLBACK_REGION: &str = "us-east-1";

/// Page size for listings.
pub const LIST_BATCH_SIZE: i32 = 1000;

/// Object size and entity tag from a `HeadObject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    /// Content length, when the server reported one.
    pub size: Option<u64>,
    /// Entity tag, when the server reported one.
    pub etag: Option<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Object keys on this page.
    pub keys: Vec<String>,
    /// Common prefixes on this page (delimited listings only).
    pub prefixes: Vec<String>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// S3-compatible client configured for one endpoint.
#[derive(Debug, Clone)]
pub struct ObjectClient {
    inner: Client,
}

impl ObjectClient {
    /// Builds the SDK client from the object store config and a credential provider.
    #[must_use]
    pub fn new(config: &ObjectStoreConfig, credentials: SharedCredentialsProvider) -> Self {
        let region = if config.region.is_empty() {
            FALLBACK_REGION.to_string()
        } else {
            config.region.clone()
        };
        let (calculation, validation) = if config.enable_crc {
            (
                RequestChecksumCalculation::WhenSupported,
                ResponseChecksumValidation::WhenSupported,
            )
        } else {
            (
                RequestChecksumCalculation::WhenRequired,
                ResponseChecksumValidation::WhenRequired,
            )
        };

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_retry_count.max(1)))
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .request_checksum_calculation(calculation)
            .response_checksum_validation(validation);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        debug!(endpoint = ?config.endpoint, region = %config.region, "object storage client built");
        Self {
            inner: Client::from_conf(builder.build()),
        }
    }

    /// Fetches size and entity tag of an object.
    pub async fn head(&self, bucket: &str, key: &str) -> Result<ObjectHead, TransferError> {
        let output = self
            .inner
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("HeadObject", bucket, key, &e))?;
        Ok(ObjectHead {
            size: output.content_length().and_then(|len| u64::try_from(len).ok()),
            etag: output.e_tag().map(str::to_string),
        })
    }

    /// Uploads a whole object in one request.
    pub async fn put(&self, bucket: &str, key: &str, body: ByteStream) -> Result<(), TransferError> {
        self.inner
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| sdk_error("PutObject", bucket, key, &e))?;
        Ok(())
    }

    /// Starts a multipart upload and returns its id.
    pub async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, TransferError> {
        let output = self
            .inner
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("CreateMultipartUpload", bucket, key, &e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateMultipartUpload", bucket, key, "UploadId"))
    }

    /// Uploads one part and returns its entity tag.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: ByteStream,
    ) -> Result<String, TransferError> {
        let output = self
            .inner
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .map_err(|e| sdk_error("UploadPart", bucket, key, &e))?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| missing_field("UploadPart", bucket, key, "ETag"))
    }

    /// Completes a multipart upload from `(part_number, etag)` pairs.
    pub async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<(), TransferError> {
        let completed = parts
            .iter()
            .map(|(number, etag)| CompletedPart::builder().part_number(*number).e_tag(etag).build())
            .collect::<Vec<_>>();
        self.inner
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(completed)).build())
            .send()
            .await
            .map_err(|e| sdk_error("CompleteMultipartUpload", bucket, key, &e))?;
        Ok(())
    }

    /// Opens an object body, optionally restricted to an inclusive byte range.
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream, TransferError> {
        let output = self
            .inner
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range.map(|(start, end)| format!("bytes={start}-{end}")))
            .send()
            .await
            .map_err(|e| sdk_error("GetObject", bucket, key, &e))?;
        Ok(output.body)
    }

    /// Lists one page of keys below `prefix`.
    pub async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        token: Option<String>,
    ) -> Result<ListPage, TransferError> {
        let output = self
            .inner
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(LIST_BATCH_SIZE)
            .set_delimiter(delimiter.map(str::to_string))
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| sdk_error("ListObjectsV2", bucket, prefix, &e))?;

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            keys: output
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string))
                .collect(),
            prefixes: output
                .common_prefixes()
                .iter()
                .filter_map(|prefix| prefix.prefix().map(str::to_string))
                .collect(),
            next_token,
        })
    }
}

/// Streams `len` bytes of `path` starting at `offset` as a request body.
///
/// # Errors
///
/// Returns [`TransferError::Io`] when the file cannot be opened or is shorter
/// than `offset + len`.
pub async fn file_body(path: &Path, offset: u64, len: u64) -> Result<ByteStream, TransferError> {
    ByteStream::read_from()
        .path(path)
        .offset(offset)
        .length(Length::Exact(len))
        .build()
        .await
        .map_err(|e| TransferError::io(path, std::io::Error::other(e)))
}

/// Flattens an SDK failure into a [`TransferError::ObjectStore`].
fn sdk_error<E>(
    operation: &'static str,
    bucket: &str,
    key: &str,
    err: &SdkError<E, HttpResponse>,
) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    TransferError::ObjectStore(ObjectStoreError {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        status: err.raw_response().map(|response| response.status().as_u16()),
        code: err.code().map(str::to_string),
        message: err
            .message()
            .map_or_else(|| DisplayErrorContext(err).to_string(), str::to_string),
    })
}

fn missing_field(operation: &'static str, bucket: &str, key: &str, field: &str) -> TransferError {
    TransferError::ObjectStore(ObjectStoreError {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        status: None,
        code: None,
        message: format!("response is missing {field}"),
    })
}

/// Wraps a body read failure.
pub(crate) fn body_error(bucket: &str, key: &str, err: &impl std::fmt::Display) -> TransferError {
    TransferError::ObjectStore(ObjectStoreError {
        operation: "GetObject",
        bucket: bucket.to_string(),
        key: key.to_string(),
        status: None,
        code: None,
        message: format!("body read failed: {err}"),
    })
}
