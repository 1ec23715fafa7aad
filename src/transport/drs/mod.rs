//! GA4GH DRS resolution backend.
//!
//! A `drs://host[:port]/<object_id>` reference is resolved against the host's
//! DRS v1 API to an HTTPS access URL, downloaded through [`HttpTransport`],
//! then verified against the advertised size and MD5 checksum. Only file
//! download is supported.

pub mod models;

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use self::models::{ACCESS_TYPE_HTTPS, AccessMethod, AccessUrl, GetAccessResponse, GetObjectResponse};
use super::http::{HttpTransport, build_client};
use super::{TransferContext, TransferError, Transport};
use crate::checker::checker_for;
use crate::config::DrsConfig;
use crate::manifest::RemoteUrl;

/// Header carrying the passport on metadata requests.
pub const PASSPORTS_HEADER: &str = "passports";

/// Characters allowed in an object id.
#[allow(clippy::expect_used)]
static OBJECT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.\-_~]+$").expect("object id regex is valid") // Static pattern, safe to panic
});

/// Where one object's metadata lives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectEndpoint {
    object_id: String,
    url: String,
}

/// DRS resolver and downloader.
#[derive(Clone)]
pub struct DrsTransport {
    client: Client,
    passport: Option<String>,
    insecure_domain: Option<String>,
}

impl std::fmt::Debug for DrsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrsTransport")
            .field("passport", &self.passport.as_ref().map(|_| "<redacted>"))
            .field("insecure_domain", &self.insecure_domain)
            .finish_non_exhaustive()
    }
}

impl DrsTransport {
    /// Creates the transport.
    ///
    /// # Errors
    ///
    /// See [`build_client`].
    pub fn new(config: &DrsConfig) -> Result<Self, TransferError> {
        Ok(Self {
            client: build_client()?,
            passport: config.passport.clone().filter(|p| !p.is_empty()),
            insecure_domain: config.insecure_domain.clone().filter(|d| !d.is_empty()),
        })
    }

    fn endpoint(&self, remote: &RemoteUrl) -> Result<ObjectEndpoint, TransferError> {
        let object_id = remote
            .path()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        if !OBJECT_ID_PATTERN.is_match(object_id) {
            return Err(TransferError::invalid_remote(
                remote.redacted(),
                format!("invalid object id {object_id:?}"),
            ));
        }
        if remote.host().is_empty() {
            return Err(TransferError::invalid_remote(remote.redacted(), "missing host"));
        }

        let scheme = if self.insecure_domain.as_deref() == Some(remote.host()) {
            "http"
        } else {
            "https"
        };
        let authority = match remote.port() {
            Some(port) => format!("{}:{port}", remote.host()),
            None => remote.host().to_string(),
        };
        Ok(ObjectEndpoint {
            object_id: object_id.to_string(),
            url: format!("{scheme}://{authority}/ga4gh/drs/v1/objects/{object_id}"),
        })
    }

    async fn get_object(&self, endpoint: &ObjectEndpoint) -> Result<GetObjectResponse, TransferError> {
        let request = match &self.passport {
            Some(passport) => self
                .client
                .post(&endpoint.url)
                .header(PASSPORTS_HEADER, passport)
                .bearer_auth(passport),
            None => self.client.get(&endpoint.url),
        };
        let response = request
            .send()
            .await
            .map_err(|e| TransferError::network(&endpoint.url, e))?;
        if !response.status().is_success() {
            return Err(TransferError::http_status(&endpoint.url, response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| TransferError::network(&endpoint.url, e))
    }

    async fn get_access_url(
        &self,
        endpoint: &ObjectEndpoint,
        access_id: &str,
    ) -> Result<AccessUrl, TransferError> {
        let url = format!("{}/access/{access_id}", endpoint.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransferError::network(&url, e))?;
        if !response.status().is_success() {
            return Err(TransferError::http_status(&url, response.status().as_u16()));
        }
        let access: GetAccessResponse = response
            .json()
            .await
            .map_err(|e| TransferError::network(&url, e))?;
        Ok(access.access_url)
    }

    /// Downloads through the first usable HTTPS access method.
    async fn download_via(
        &self,
        ctx: &TransferContext,
        endpoint: &ObjectEndpoint,
        methods: &[AccessMethod],
        local: &Path,
    ) -> Result<(), TransferError> {
        if methods.is_empty() {
            return Err(TransferError::resolution(&endpoint.object_id, "no access methods"));
        }

        for method in methods {
            if method.kind != ACCESS_TYPE_HTTPS {
                debug!(kind = %method.kind, "skipping unsupported access method");
                continue;
            }
            let access = if method.access_url.url.is_empty() {
                match self.get_access_url(endpoint, &method.access_id).await {
                    Ok(access) if !access.url.is_empty() => access,
                    Ok(_) => {
                        warn!(access_id = %method.access_id, "access endpoint returned no URL");
                        continue;
                    }
                    Err(e) => {
                        warn!(access_id = %method.access_id, error = %e, "no usable access URL");
                        continue;
                    }
                }
            } else {
                method.access_url.clone()
            };

            let display_str = display_url(&access.url);
            info!(url = %display_str, "downloading DRS object");
            let http = HttpTransport::with_client(self.client.clone()).with_headers(access.headers);
            http.get_to_file(ctx, &access.url, &display_str, local).await?;
            return Ok(());
        }

        Err(TransferError::resolution(
            &endpoint.object_id,
            "no usable https access method",
        ))
    }
}

/// Checks size and, when published, the MD5 digest of the downloaded file.
async fn verify(local: &Path, object: &GetObjectResponse) -> Result<(), TransferError> {
    let actual = tokio::fs::metadata(local)
        .await
        .map_err(|e| TransferError::io(local, e))?
        .len();
    if actual != object.size {
        return Err(TransferError::integrity(
            local,
            format!("size {actual} does not match advertised {}", object.size),
        ));
    }

    if object.checksums.is_empty() {
        return Ok(());
    }
    let Some(checker) = object
        .checksums
        .iter()
        .find_map(|c| checker_for(&c.kind, &c.checksum))
    else {
        warn!("no supported checksum type, skipping verification");
        return Ok(());
    };
    if !checker.check(local).await? {
        return Err(TransferError::integrity(local, "checksum mismatch"));
    }
    Ok(())
}

/// URL without query string or credentials, for logs.
fn display_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        Err(_) => "<unparsable access url>".to_string(),
    }
}

fn unsupported(remote: &RemoteUrl, operation: &str) -> TransferError {
    TransferError::invalid_remote(remote.redacted(), format!("{operation} is not supported over DRS"))
}

#[async_trait]
impl Transport for DrsTransport {
    fn name(&self) -> &'static str {
        "drs"
    }

    async fn upload_file(
        &self,
        _ctx: &TransferContext,
        _local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        Err(unsupported(remote, "upload"))
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn download_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let endpoint = self.endpoint(remote)?;
        ctx.run(async {
            let object = self.get_object(&endpoint).await?;
            debug!(object_id = %endpoint.object_id, size = object.size, "resolved DRS object");
            self.download_via(ctx, &endpoint, &object.access_methods, local)
                .await?;
            verify(local, &object).await
        })
        .await
    }

    async fn upload_dir(
        &self,
        _ctx: &TransferContext,
        _local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        Err(unsupported(remote, "directory upload"))
    }

    async fn download_dir(
        &self,
        _ctx: &TransferContext,
        _local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        Err(unsupported(remote, "directory download"))
    }
}
