//! Transfer entities and their remote URLs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use url::Url;

use crate::error::FilerError;

/// Whether an entity is a single file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A single regular file.
    File,
    /// A directory, transferred recursively.
    Directory,
}

impl FromStr for EntityKind {
    type Err = FilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            _ => Err(FilerError::invalid_argument("entity.type", s)),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Directory => "directory",
        })
    }
}

/// The protocol that governs an entity's remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// S3-compatible object storage.
    S3,
    /// Vendor object storage.
    Tos,
    /// Plain HTTP or HTTPS.
    Http,
    /// FTP.
    Ftp,
    /// GA4GH DRS object reference.
    Drs,
    /// Local mount (symlink on download, copy on upload).
    File,
}

impl Scheme {
    /// Resolves a URL scheme string, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] for anything outside the
    /// supported set.
    pub fn parse(raw: &str) -> Result<Self, FilerError> {
        match raw.to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "tos" => Ok(Self::Tos),
            "http" | "https" => Ok(Self::Http),
            "ftp" => Ok(Self::Ftp),
            "drs" => Ok(Self::Drs),
            "file" | "" => Ok(Self::File),
            _ => Err(FilerError::invalid_argument("entity.scheme", raw)),
        }
    }

    /// Upper-case label embedded in completion marker names.
    #[must_use]
    pub fn marker_label(self) -> &'static str {
        match self {
            Self::S3 => "S3",
            Self::Tos => "TOS",
            Self::Http => "HTTP",
            Self::Ftp => "FTP",
            Self::Drs => "DRS",
            Self::File => "FILE",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::S3 => "s3",
            Self::Tos => "tos",
            Self::Http => "http",
            Self::Ftp => "ftp",
            Self::Drs => "drs",
            Self::File => "file",
        })
    }
}

/// `user:password` taken from a URL's userinfo, percent-decoded.
#[derive(Clone, PartialEq, Eq)]
pub struct EmbeddedCredentials {
    /// Decoded user name (access key for object storage).
    pub username: String,
    /// Decoded password (secret key for object storage).
    pub password: Option<String>,
}

impl fmt::Debug for EmbeddedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A parsed remote location.
///
/// `raw` is kept verbatim because it participates in the completion marker
/// hash. For object storage schemes `host` is the bucket and `path` is the key
/// with its leading slash removed; for everything else `path` is the URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    raw: String,
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    path: String,
    credentials: Option<EmbeddedCredentials>,
}

impl RemoteUrl {
    /// Parses a remote URL.
    ///
    /// Strings without a scheme are treated as local-mount paths.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] if the scheme delimiter is
    /// malformed or the scheme is unsupported.
    pub fn parse(raw: &str) -> Result<Self, FilerError> {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase)
                if !raw.starts_with(':') && !raw.contains("://") =>
            {
                return Ok(Self {
                    raw: raw.to_string(),
                    scheme: Scheme::File,
                    host: String::new(),
                    port: None,
                    path: raw.to_string(),
                    credentials: None,
                });
            }
            Err(err) => {
                return Err(FilerError::invalid_argument(
                    "entity.url",
                    format!("{raw}: {err}"),
                ));
            }
        };

        let scheme = Scheme::parse(url.scheme())?;
        let credentials = decode_credentials(&url)?;
        let decoded_path = urlencoding::decode(url.path())
            .map_err(|_| FilerError::invalid_argument("entity.url", raw))?
            .into_owned();
        let path = match scheme {
            Scheme::S3 | Scheme::Tos => decoded_path.trim_start_matches('/').to_string(),
            _ => decoded_path,
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host: url.host_str().unwrap_or_default().to_string(),
            port: url.port(),
            path,
            credentials,
        })
    }

    /// The URL exactly as it appeared in the manifest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The resolved scheme.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name, or bucket for object storage.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if the URL had one.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Path component (object key for object storage).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Credentials embedded in the URL, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<&EmbeddedCredentials> {
        self.credentials.as_ref()
    }

    /// The URL with any embedded `user:password` removed, for logging.
    #[must_use]
    pub fn redacted(&self) -> String {
        if self.credentials.is_none() {
            return self.raw.clone();
        }
        match Url::parse(&self.raw) {
            Ok(mut url) => {
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.to_string()
            }
            Err(_) => self.raw.clone(),
        }
    }

    /// Appends a `/`-separated relative path below this location.
    ///
    /// The result keeps the scheme, host and credentials.
    #[must_use]
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        Self {
            raw: format!("{}{relative}", ensure_trailing_slash(&self.raw)),
            path: format!("{}{relative}", ensure_trailing_slash(&self.path)),
            ..self.clone()
        }
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Returns `s` with exactly one trailing `/` unless it is empty.
#[must_use]
pub fn ensure_trailing_slash(s: &str) -> String {
    if s.is_empty() || s.ends_with('/') {
        s.to_string()
    } else {
        format!("{s}/")
    }
}

fn decode_credentials(url: &Url) -> Result<Option<EmbeddedCredentials>, FilerError> {
    if url.username().is_empty() && url.password().is_none() {
        return Ok(None);
    }
    let decode = |value: &str| {
        urlencoding::decode(value)
            .map(std::borrow::Cow::into_owned)
            .map_err(|_| FilerError::invalid_argument("entity.url.userinfo", "not valid UTF-8"))
    };
    Ok(Some(EmbeddedCredentials {
        username: decode(url.username())?,
        password: url.password().map(decode).transpose()?,
    }))
}

/// One file or directory to move, as declared in the manifest.
#[derive(Debug, Clone)]
pub struct TransferEntity {
    /// Declared name.
    pub name: String,
    /// Informational description.
    pub description: String,
    /// Remote side of the transfer.
    pub remote: RemoteUrl,
    /// Local side of the transfer. Never empty.
    pub local_path: PathBuf,
    /// File or directory.
    pub kind: EntityKind,
}

/// JSON shape of one manifest element.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityRecord {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form note, logged only.
    #[serde(default)]
    pub description: String,
    /// Remote URL, possibly carrying `user:password`.
    #[serde(default)]
    pub url: String,
    /// Local file or directory path.
    #[serde(default)]
    pub path: String,
    /// `file` or `directory`, any case.
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl TryFrom<EntityRecord> for TransferEntity {
    type Error = FilerError;

    fn try_from(record: EntityRecord) -> Result<Self, Self::Error> {
        let kind = record.kind.parse::<EntityKind>()?;
        if record.path.is_empty() {
            return Err(FilerError::invalid_argument(
                "entity.path",
                format!("empty local path for {}", record.name),
            ));
        }
        let remote = RemoteUrl::parse(&record.url)?;
        Ok(Self {
            name: record.name,
            description: record.description,
            remote,
            local_path: PathBuf::from(record.path),
            kind,
        })
    }
}

impl TransferEntity {
    /// Local path as a borrowed [`Path`].
    #[must_use]
    pub fn local(&self) -> &Path {
        &self.local_path
    }

    /// Scheme of the remote side.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.remote.scheme()
    }
}
