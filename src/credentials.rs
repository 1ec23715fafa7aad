//! Credential sources for object storage clients.
//!
//! Precedence: `user:password` embedded in the entity URL, then rotating file
//! credentials when an expiration file exists, then the static secret file.
//! Rotating credentials are re-read by the SDK when the cached ones expire;
//! nothing refreshes them in the background.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider, future};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::config::{ObjectStorePaths, SecretConfig, env};
use crate::error::FilerError;
use crate::manifest::EmbeddedCredentials;
use crate::transport::TransferError;

const PROVIDER_EMBEDDED: &str = "filer-embedded";
const PROVIDER_STATIC: &str = "filer-static-file";
const PROVIDER_REFRESHING: &str = "filer-refreshing-file";

/// Which kind of credential source was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// From the entity URL.
    Embedded,
    /// Read once from the secret file.
    Static,
    /// Re-read from the secret and expiration files on expiry.
    Refreshing,
}

/// Credentials re-read from disk whenever the previous set expires.
#[derive(Debug, Clone)]
pub struct RefreshingFileCredentials {
    credentials_file: PathBuf,
    expiration_file: PathBuf,
}

impl RefreshingFileCredentials {
    /// Creates a provider over the two files.
    #[must_use]
    pub fn new(credentials_file: impl Into<PathBuf>, expiration_file: impl Into<PathBuf>) -> Self {
        Self {
            credentials_file: credentials_file.into(),
            expiration_file: expiration_file.into(),
        }
    }

    /// Reads the current credentials and their expiry.
    ///
    /// # Errors
    ///
    /// Fails if either file is unreadable or the timestamp is not RFC 3339.
    pub async fn load(&self) -> Result<Credentials, FilerError> {
        let secret = SecretConfig::load(&self.credentials_file).await?;
        let expires_at = read_expiration(&self.expiration_file).await?;
        debug!(expires_at = ?expires_at, "loaded rotating credentials");
        Ok(Credentials::new(
            secret.access_key,
            secret.secret_key,
            secret.session_token,
            Some(expires_at),
            PROVIDER_REFRESHING,
        ))
    }
}

impl ProvideCredentials for RefreshingFileCredentials {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(async move {
            self.load().await.map_err(CredentialsError::provider_error)
        })
    }
}

/// Parses the RFC 3339 timestamp stored in `path`.
///
/// # Errors
///
/// Fails if the file is unreadable or the content is not RFC 3339.
pub async fn read_expiration(path: &Path) -> Result<SystemTime, FilerError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FilerError::internal("read credential expiration", TransferError::io(path, e)))?;
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| FilerError::invalid_argument("credential expiration", format!("{raw:?}: {e}")))?;
    Ok(SystemTime::from(parsed.with_timezone(&Utc)))
}

/// Selects and builds the credential provider for an object storage client.
///
/// # Errors
///
/// - [`FilerError::InvalidArgument`] if no source is configured
/// - the errors of [`SecretConfig::load`] for the static source
#[instrument(skip_all)]
pub async fn resolve_provider(
    paths: &ObjectStorePaths,
    embedded: Option<&EmbeddedCredentials>,
) -> Result<(CredentialKind, SharedCredentialsProvider), FilerError> {
    if let Some(EmbeddedCredentials {
        username,
        password: Some(password),
    }) = embedded
    {
        debug!("using credentials embedded in URL");
        let creds = Credentials::new(username, password, None, None, PROVIDER_EMBEDDED);
        return Ok((CredentialKind::Embedded, SharedCredentialsProvider::new(creds)));
    }

    let Some(credentials_file) = paths.credentials_file.as_deref() else {
        return Err(FilerError::invalid_argument(
            env::SHARED_CREDENTIALS_FILE,
            "not set and no credentials embedded in URL",
        ));
    };

    if let Some(expiration_file) = paths.expiration_file.as_deref()
        && tokio::fs::try_exists(expiration_file).await.unwrap_or(false)
    {
        debug!(path = %expiration_file.display(), "using rotating file credentials");
        let provider = RefreshingFileCredentials::new(credentials_file, expiration_file);
        return Ok((CredentialKind::Refreshing, SharedCredentialsProvider::new(provider)));
    }

    let secret = SecretConfig::load(credentials_file).await?;
    debug!("using static file credentials");
    let creds = Credentials::new(
        secret.access_key,
        secret.secret_key,
        secret.session_token,
        None,
        PROVIDER_STATIC,
    );
    Ok((CredentialKind::Static, SharedCredentialsProvider::new(creds)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::FilerErrorKind;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const SECRET: &str = "[default]\naws_access_key_id = AK\naws_secret_access_key = SK\n";

    #[tokio::test]
    async fn test_embedded_credentials_win() {
        let embedded = EmbeddedCredentials {
            username: "URL_AK".to_string(),
            password: Some("URL_SK".to_string()),
        };
        let (kind, _) = resolve_provider(&ObjectStorePaths::default(), Some(&embedded)).await.unwrap();
        assert_eq!(kind, CredentialKind::Embedded);
    }

    #[tokio::test]
    async fn test_username_without_password_falls_back_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ObjectStorePaths {
            credentials_file: Some(write(dir.path(), "credentials", SECRET)),
            ..ObjectStorePaths::default()
        };
        let embedded = EmbeddedCredentials {
            username: "only-user".to_string(),
            password: None,
        };
        let (kind, _) = resolve_provider(&paths, Some(&embedded)).await.unwrap();
        assert_eq!(kind, CredentialKind::Static);
    }

    #[tokio::test]
    async fn test_missing_credentials_file_setting_is_invalid() {
        let err = resolve_provider(&ObjectStorePaths::default(), None).await.unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_expiration_file_selects_refreshing_provider() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ObjectStorePaths {
            config_file: None,
            credentials_file: Some(write(dir.path(), "credentials", SECRET)),
            expiration_file: Some(write(dir.path(), "expired", "2030-01-02T03:04:05Z\n")),
        };
        let (kind, _) = resolve_provider(&paths, None).await.unwrap();
        assert_eq!(kind, CredentialKind::Refreshing);
    }

    #[tokio::test]
    async fn test_absent_expiration_file_selects_static_provider() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ObjectStorePaths {
            config_file: None,
            credentials_file: Some(write(dir.path(), "credentials", SECRET)),
            expiration_file: Some(dir.path().join("absent")),
        };
        let (kind, _) = resolve_provider(&paths, None).await.unwrap();
        assert_eq!(kind, CredentialKind::Static);
    }

    #[tokio::test]
    async fn test_refreshing_load_rereads_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write(dir.path(), "credentials", SECRET);
        let expiry = write(dir.path(), "expired", "2030-01-02T03:04:05Z");
        let provider = RefreshingFileCredentials::new(&secret, &expiry);

        let first = provider.load().await.unwrap();
        assert_eq!(first.access_key_id(), "AK");
        assert_eq!(
            first.expiry().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_893_553_445)
        );

        std::fs::write(
            &secret,
            "[default]\naws_access_key_id = AK2\naws_secret_access_key = SK2\naws_session_token = T2\n",
        )
        .unwrap();
        let second = provider.load().await.unwrap();
        assert_eq!(second.access_key_id(), "AK2");
        assert_eq!(second.session_token(), Some("T2"));
    }

    #[tokio::test]
    async fn test_provider_reads_files_on_each_request() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write(dir.path(), "credentials", SECRET);
        let expiry = write(dir.path(), "expired", "2030-01-02T03:04:05Z");
        let provider = RefreshingFileCredentials::new(&secret, &expiry);

        let creds = provider.provide_credentials().await.unwrap();
        assert_eq!(creds.access_key_id(), "AK");

        std::fs::remove_file(&expiry).unwrap();
        assert!(provider.provide_credentials().await.is_err());
    }

    #[tokio::test]
    async fn test_bad_expiration_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "expired", "tomorrow");
        let err = read_expiration(&path).await.unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }
}
