//! Plain HTTP(S) backend.
//!
//! Uploads are a single `PUT` of the whole file; downloads a single `GET`
//! streamed to disk. Both succeed only on `200 OK`. Directory downloads are
//! not possible over plain HTTP.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

use super::{TransferContext, TransferError, Transport, ensure_parent_dir, walk};
use crate::manifest::RemoteUrl;

/// HTTP connect timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Builds the HTTP client shared by the HTTP and DRS backends.
///
/// No overall request timeout is set; bodies can be arbitrarily large.
///
/// # Errors
///
/// Returns [`TransferError::Network`] if the TLS backend cannot be initialized.
pub fn build_client() -> Result<Client, TransferError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(concat!("task-filer/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TransferError::network("<client>", e))
}

/// HTTP(S) transport with a fixed set of request headers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    /// Creates a transport over a fresh client.
    ///
    /// # Errors
    ///
    /// See [`build_client`].
    pub fn new() -> Result<Self, TransferError> {
        Ok(Self::with_client(build_client()?))
    }

    /// Creates a transport sharing an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            headers: Vec::new(),
        }
    }

    /// Adds headers sent on every request.
    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Downloads `url` into `local`, returning the bytes written.
    ///
    /// `display` is what appears in logs and errors in place of the URL.
    ///
    /// # Errors
    ///
    /// - [`TransferError::Network`] on request or body failure
    /// - [`TransferError::HttpStatus`] for any status but 200
    /// - [`TransferError::Io`] when the local file cannot be written
    pub async fn get_to_file(
        &self,
        ctx: &TransferContext,
        url: &str,
        display: &str,
        local: &Path,
    ) -> Result<u64, TransferError> {
        ctx.run(async {
            let mut request = self.client.get(url);
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let response = request
                .send()
                .await
                .map_err(|e| TransferError::network(display, e))?;
            if response.status() != StatusCode::OK {
                return Err(TransferError::http_status(display, response.status().as_u16()));
            }

            ensure_parent_dir(local).await?;
            let file = File::create(local)
                .await
                .map_err(|e| TransferError::io(local, e))?;
            stream_to_file(file, response, display, local).await
        })
        .await
    }
}

/// Streams a response body to `file`, returning bytes written.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    display: &str,
    path: &Path,
) -> Result<u64, TransferError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransferError::network(display, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| TransferError::io(path, e))?;
    Ok(written)
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn upload_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let display = remote.redacted();
        ctx.run(async {
            let file = File::open(local)
                .await
                .map_err(|e| TransferError::io(local, e))?;
            let size = file
                .metadata()
                .await
                .map_err(|e| TransferError::io(local, e))?
                .len();

            let mut request = self
                .client
                .put(remote.as_str())
                .header(CONTENT_LENGTH, size)
                .body(Body::wrap_stream(ReaderStream::new(file)));
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let response = request
                .send()
                .await
                .map_err(|e| TransferError::network(&display, e))?;
            if response.status() != StatusCode::OK {
                return Err(TransferError::http_status(&display, response.status().as_u16()));
            }
            info!(bytes = size, "uploaded");
            Ok(())
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
        let bytes = self
            .get_to_file(ctx, remote.as_str(), &remote.redacted(), local)
            .await?;
        info!(bytes, "downloaded");
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

    async fn download_dir(
        &self,
        _ctx: &TransferContext,
        _local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        debug!(remote = %remote, "rejecting directory download");
        Err(TransferError::invalid_remote(
            remote.redacted(),
            "directory download is not supported over HTTP",
        ))
    }
}
