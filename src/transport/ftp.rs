//! FTP backend.
//!
//! A single control connection is opened and logged in when the transport is
//! built, then shared by every operation of the run. The FTP client is
//! blocking, so each operation holds the connection on a blocking worker.
//! Remote paths are the path component of the entity URL; the server and
//! credentials always come from the FTP configuration.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, instrument};

use super::{TransferContext, TransferError, Transport, ensure_parent_dir, walk};
use crate::config::FtpConfig;
use crate::manifest::RemoteUrl;

/// Port used when `FTP_URL` does not carry one.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// FTP transport over one shared, logged-in control connection.
pub struct FtpTransport {
    address: String,
    stream: Arc<Mutex<FtpStream>>,
}

impl std::fmt::Debug for FtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpTransport")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl FtpTransport {
    /// Connects to the configured server and logs in.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Ftp`] if the connection, login or switch to
    /// binary mode fails.
    #[instrument(skip_all)]
    pub async fn connect(config: &FtpConfig) -> Result<Self, TransferError> {
        let address = server_address(&config.url);
        let user = config.access_key.clone();
        let password = config.secret_key.clone();
        let target = address.clone();

        let stream = tokio::task::spawn_blocking(move || {
            let mut stream =
                FtpStream::connect(&target).map_err(|e| TransferError::ftp("connect", &target, e))?;
            stream
                .login(&user, &password)
                .map_err(|e| TransferError::ftp("login", &target, e))?;
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| TransferError::ftp("type", &target, e))?;
            Ok::<_, TransferError>(stream)
        })
        .await??;

        info!(address = %address, "FTP session established");
        Ok(Self {
            address,
            stream: Arc::new(Mutex::new(stream)),
        })
    }

    /// Runs `operation` against the shared connection on a blocking worker.
    async fn with_stream<T, F>(&self, ctx: &TransferContext, operation: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, TransferError> + Send + 'static,
    {
        let stream = Arc::clone(&self.stream);
        ctx.run(async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = stream.lock().unwrap_or_else(PoisonError::into_inner);
                operation(&mut guard)
            })
            .await?
        })
        .await
    }
}

/// Accepts `host`, `host:port` or `ftp://host[:port][/...]`.
fn server_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("ftp://")
        .unwrap_or(trimmed)
        .split('/')
        .next()
        .unwrap_or_default();
    let host_port = without_scheme
        .rsplit_once('@')
        .map_or(without_scheme, |(_, rest)| rest);
    if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{host_port}:{DEFAULT_FTP_PORT}")
    }
}

/// Every ancestor directory of `path`, shallowest first.
fn ancestor_dirs(path: &str) -> Vec<String> {
    let Some((parent, _)) = path.rsplit_once('/') else {
        return Vec::new();
    };
    let mut dirs = Vec::new();
    let mut current = String::new();
    for segment in parent.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        dirs.push(current.clone());
    }
    if !path.starts_with('/') {
        for dir in &mut dirs {
            dir.remove(0);
        }
    }
    dirs
}

/// Replies servers send to `MKD` for a directory that is already there.
const DIR_EXISTS_CODES: [u32; 2] = [550, 521];

/// True when a failed `MKD` only means the directory exists.
fn is_existing_dir(err: &FtpError) -> bool {
    let FtpError::UnexpectedResponse(response) = err else {
        return false;
    };
    // 521 has no named status, so fall back to the code at the start of the reply.
    let code = match response.status.code() {
        0 => std::str::from_utf8(&response.body)
            .ok()
            .and_then(|reply| reply.get(..3))
            .and_then(|digits| digits.parse().ok())
            .unwrap_or_default(),
        code => code,
    };
    DIR_EXISTS_CODES.contains(&code)
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

fn retrieve(stream: &mut FtpStream, remote: &str, local: &Path) -> Result<u64, TransferError> {
    let mut file = fs::File::create(local).map_err(|e| TransferError::io(local, e))?;
    stream
        .retr(remote, |reader| {
            io::copy(reader, &mut file).map_err(FtpError::ConnectionError)
        })
        .map_err(|e| TransferError::ftp("RETR", remote, e))
}

fn retrieve_tree(
    ctx: &TransferContext,
    stream: &mut FtpStream,
    remote: &str,
    local: &Path,
) -> Result<(), TransferError> {
    let lines = stream
        .list(Some(remote))
        .map_err(|e| TransferError::ftp("LIST", remote, e))?;

    for line in lines {
        ctx.check()?;
        let Ok(entry) = line.parse::<ListEntry>() else {
            debug!(line = %line, "skipping unparsable listing line");
            continue;
        };
        if matches!(entry.name(), "." | "..") {
            continue;
        }

        let remote_child = join_remote(remote, entry.name());
        let local_child = local.join(entry.name());
        if entry.is_directory() {
            fs::create_dir_all(&local_child).map_err(|e| TransferError::io(&local_child, e))?;
            retrieve_tree(ctx, stream, &remote_child, &local_child)?;
        } else if entry.is_file() {
            let bytes = retrieve(stream, &remote_child, &local_child)?;
            debug!(remote = %remote_child, bytes, "retrieved");
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for FtpTransport {
    fn name(&self) -> &'static str {
        "ftp"
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn upload_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        let path = remote.path().to_string();
        let source = local.to_path_buf();
        let bytes = self
            .with_stream(ctx, move |stream| {
                for dir in ancestor_dirs(&path) {
                    match stream.mkdir(&dir) {
                        Ok(()) => debug!(dir = %dir, "created remote directory"),
                        Err(e) if is_existing_dir(&e) => {}
                        Err(e) => return Err(TransferError::ftp("MKD", &dir, e)),
                    }
                }
                let mut file = fs::File::open(&source).map_err(|e| TransferError::io(&source, e))?;
                stream
                    .put_file(&path, &mut file)
                    .map_err(|e| TransferError::ftp("STOR", &path, e))
            })
            .await?;
        info!(bytes, "stored");
        Ok(())
    }

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn download_file(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        ensure_parent_dir(local).await?;
        let path = remote.path().to_string();
        let target = local.to_path_buf();
        let bytes = self
            .with_stream(ctx, move |stream| retrieve(stream, &path, &target))
            .await?;
        info!(bytes, "retrieved");
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

    #[instrument(skip_all, fields(local = %local.display(), remote = %remote))]
    async fn download_dir(
        &self,
        ctx: &TransferContext,
        local: &Path,
        remote: &RemoteUrl,
    ) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(local)
            .await
            .map_err(|e| TransferError::io(local, e))?;
        let path = remote.path().to_string();
        let target = local.to_path_buf();
        let walk_ctx = ctx.clone();
        self.with_stream(ctx, move |stream| {
            retrieve_tree(&walk_ctx, stream, &path, &target)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use suppaftp::Status;
    use suppaftp::types::Response;

    use super::*;

    #[test]
    fn test_server_address_forms() {
        assert_eq!(server_address("ftp.example.com"), "ftp.example.com:21");
        assert_eq!(server_address("ftp.example.com:2121"), "ftp.example.com:2121");
        assert_eq!(server_address("ftp://ftp.example.com/pub"), "ftp.example.com:21");
        assert_eq!(server_address("ftp://u:p@10.0.0.1:990/"), "10.0.0.1:990");
    }

    #[test]
    fn test_ancestor_dirs_absolute_and_relative() {
        assert_eq!(ancestor_dirs("/a/b/c.txt"), vec!["/a", "/a/b"]);
        assert_eq!(ancestor_dirs("a/b/c.txt"), vec!["a", "a/b"]);
        assert!(ancestor_dirs("/c.txt").is_empty());
        assert!(ancestor_dirs("c.txt").is_empty());
    }

    #[test]
    fn test_join_remote_normalizes_slash() {
        assert_eq!(join_remote("/pub/", "a"), "/pub/a");
        assert_eq!(join_remote("/pub", "a"), "/pub/a");
    }

    #[test]
    fn test_mkdir_existing_replies_are_tolerated() {
        let exists = FtpError::UnexpectedResponse(Response::new(
            Status::FileUnavailable,
            b"550 Directory already exists".to_vec(),
        ));
        assert!(is_existing_dir(&exists));

        let unnamed = FtpError::UnexpectedResponse(Response::new(
            Status::Unknown,
            b"521 \"/pub\" directory exists".to_vec(),
        ));
        assert!(is_existing_dir(&unnamed));
    }

    #[test]
    fn test_mkdir_other_failures_propagate() {
        let denied = FtpError::UnexpectedResponse(Response::new(
            Status::NotLoggedIn,
            b"530 Not logged in".to_vec(),
        ));
        assert!(!is_existing_dir(&denied));

        let dropped = FtpError::ConnectionError(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!is_existing_dir(&dropped));
    }

    #[test]
    fn test_listing_lines_parse_into_kinds() {
        let dir: ListEntry = "drwxr-xr-x 2 ftp ftp 4096 Jan 01 12:00 sub"
            .parse()
            .unwrap();
        assert!(dir.is_directory());
        assert_eq!(dir.name(), "sub");

        let file: ListEntry = "-rw-r--r-- 1 ftp ftp 12 Jan 01 12:00 a.txt"
            .parse()
            .unwrap();
        assert!(file.is_file());
        assert_eq!(file.name(), "a.txt");

        assert!("total 8".parse::<ListEntry>().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_ftp_error() {
        let config = FtpConfig {
            url: "127.0.0.1:1".to_string(),
            access_key: "u".to_string(),
            secret_key: "p".to_string(),
        };
        let err = FtpTransport::connect(&config).await.unwrap_err();
        assert!(matches!(err, TransferError::Ftp { operation: "connect", .. }));
    }
}
