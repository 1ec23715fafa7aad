//! Runtime configuration.
//!
//! Process-level settings come from environment variables. Object storage
//! settings and secrets come from INI files whose paths are themselves given
//! by environment variables. Lookups go through a closure so tests can supply
//! a fixed map instead of mutating the process environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::FilerError;
use crate::manifest::OffloadMode;
use crate::transport::TransferError;

/// Default multipart part size (64 MiB).
pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Default SDK-level retry budget for object storage requests.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Default number of concurrent parts per multipart transfer.
pub const DEFAULT_TASK_NUM: usize = 1;

/// Floor the adaptive rate controller never halves below (1 MiB/s).
pub const DEFAULT_MIN_BANDWIDTH: u64 = 1024 * 1024;

/// Bandwidth treated as "unlimited" when no ceiling is configured (128 MiB/s).
pub const DEFAULT_MAX_BANDWIDTH: u64 = 128 * 1024 * 1024;

/// Mount roots whose paths are used as-is by the local-mount backend.
pub const DEFAULT_PASSTHROUGH_ROOTS: &[&str] = &["/tos-data/"];

/// Environment variable names.
pub mod env {
    pub const MANIFEST_FILE: &str = "POD_INFO_ANNOTATIONS_FILE";
    pub const MODE: &str = "FILER_MODE";
    pub const S3_CONFIG_FILE: &str = "S3SDK_CONFIG_FILE";
    pub const SHARED_CREDENTIALS_FILE: &str = "AWS_SHARED_CREDENTIALS_FILE";
    pub const CREDENTIALS_EXPIRED_TIME_FILE: &str = "AWS_CREDENTIALS_EXPIRED_TIME_FILE";
    pub const OFFLOAD_TYPE: &str = "OFFLOAD_TYPE";
    pub const IS_MOUNT_TOS: &str = "IS_MOUNT_TOS";
    pub const FTP_URL: &str = "FTP_URL";
    pub const FTP_ACCESS_KEY: &str = "FTP_ACCESS_KEY";
    pub const FTP_SECRET_KEY: &str = "FTP_SECRET_KEY";
    pub const HOST_BASE_PATH: &str = "HOST_BASE_PATH";
    pub const CONTAINER_BASE_PATH: &str = "CONTAINER_BASE_PATH";
    pub const MOUNT_PASSTHROUGH_ROOTS: &str = "MOUNT_PASSTHROUGH_ROOTS";
    pub const DRS_AAI_PASSPORT: &str = "DRS_AAI_PASSPORT";
    pub const DRS_INSECURE_DOMAIN: &str = "DRS_INSECURE_DOMAIN";
}

/// Paths to the object storage config, secret and expiration files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStorePaths {
    /// INI file with endpoint, region and tuning knobs.
    pub config_file: Option<PathBuf>,
    /// INI file with access key, secret key and session token.
    pub credentials_file: Option<PathBuf>,
    /// File holding an RFC 3339 expiration timestamp for rotating credentials.
    pub expiration_file: Option<PathBuf>,
}

/// FTP session settings.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FtpConfig {
    /// Server address, `host:port` or `ftp://host[:port]`.
    pub url: String,
    /// Login user.
    pub access_key: String,
    /// Login password.
    pub secret_key: String,
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("url", &self.url)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

/// Local-mount path mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMountConfig {
    /// Prefix remote paths are expressed under (host view).
    pub host_base_path: PathBuf,
    /// Where `host_base_path` is mounted inside this container.
    pub container_base_path: PathBuf,
    /// Remote paths under these roots are used unchanged.
    pub passthrough_roots: Vec<String>,
}

impl Default for LocalMountConfig {
    fn default() -> Self {
        Self {
            host_base_path: PathBuf::new(),
            container_base_path: PathBuf::new(),
            passthrough_roots: DEFAULT_PASSTHROUGH_ROOTS
                .iter()
                .map(|root| (*root).to_string())
                .collect(),
        }
    }
}

/// DRS client settings.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DrsConfig {
    /// Passport token sent with metadata requests, if configured.
    pub passport: Option<String>,
    /// Host that is contacted over plain HTTP instead of HTTPS.
    pub insecure_domain: Option<String>,
}

impl std::fmt::Debug for DrsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrsConfig")
            .field("passport", &self.passport.as_ref().map(|_| "<redacted>"))
            .field("insecure_domain", &self.insecure_domain)
            .finish()
    }
}

/// Everything the filer reads from its environment.
#[derive(Debug, Clone, Default)]
pub struct FilerConfig {
    /// Manifest path, if set in the environment.
    pub manifest_path: Option<PathBuf>,
    /// Mode string, if set in the environment.
    pub mode: Option<String>,
    /// Where `*-ref` payloads live.
    pub offload: OffloadMode,
    /// Whether remote storage is reached through a mounted filesystem.
    pub mount_retry: bool,
    /// Object storage file locations.
    pub object_store: ObjectStorePaths,
    /// FTP session.
    pub ftp: FtpConfig,
    /// Local-mount mapping.
    pub local_mount: LocalMountConfig,
    /// DRS client.
    pub drs: DrsConfig,
}

impl FilerConfig {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] for an unknown offload type.
    pub fn from_env() -> Result<Self, FilerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`. Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] for an unknown offload type.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FilerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let get_path = |key: &str| get(key).map(PathBuf::from);

        let offload = match get(env::OFFLOAD_TYPE) {
            Some(raw) => raw.parse()?,
            None => OffloadMode::default(),
        };

        let passthrough_roots = get(env::MOUNT_PASSTHROUGH_ROOTS).map_or_else(
            || LocalMountConfig::default().passthrough_roots,
            |raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|root| !root.is_empty())
                    .map(str::to_string)
                    .collect()
            },
        );

        let config = Self {
            manifest_path: get_path(env::MANIFEST_FILE),
            mode: get(env::MODE),
            offload,
            mount_retry: get(env::IS_MOUNT_TOS)
                .is_some_and(|raw| raw.trim().eq_ignore_ascii_case("true")),
            object_store: ObjectStorePaths {
                config_file: get_path(env::S3_CONFIG_FILE),
                credentials_file: get_path(env::SHARED_CREDENTIALS_FILE),
                expiration_file: get_path(env::CREDENTIALS_EXPIRED_TIME_FILE),
            },
            ftp: FtpConfig {
                url: get(env::FTP_URL).unwrap_or_default(),
                access_key: get(env::FTP_ACCESS_KEY).unwrap_or_default(),
                secret_key: get(env::FTP_SECRET_KEY).unwrap_or_default(),
            },
            local_mount: LocalMountConfig {
                host_base_path: get_path(env::HOST_BASE_PATH).unwrap_or_default(),
                container_base_path: get_path(env::CONTAINER_BASE_PATH).unwrap_or_default(),
                passthrough_roots,
            },
            drs: DrsConfig {
                passport: get(env::DRS_AAI_PASSPORT),
                insecure_domain: get(env::DRS_INSECURE_DOMAIN),
            },
        };
        debug!(?config, "configuration loaded");
        Ok(config)
    }
}

/// Object storage tuning read from the `[default]` section of the config INI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Declared storage type; `tos` selects the vendor implementation.
    pub s3_type: String,
    /// Service endpoint URL.
    pub endpoint: Option<String>,
    /// Signing region.
    pub region: String,
    /// Part size threshold and default part size in bytes.
    pub part_size: u64,
    /// Concurrent parts per multipart transfer.
    pub task_num: usize,
    /// Whether request checksums are calculated and response checksums validated.
    pub enable_crc: bool,
    /// Bandwidth ceiling in bytes per second; 0 means none.
    pub max_bandwidth: u64,
    /// SDK-level retry attempts.
    pub max_retry_count: u32,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            s3_type: String::new(),
            endpoint: None,
            region: String::new(),
            part_size: DEFAULT_PART_SIZE,
            task_num: DEFAULT_TASK_NUM,
            enable_crc: false,
            max_bandwidth: 0,
            max_retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

impl ObjectStoreConfig {
    /// Returns true when the declared storage type selects the vendor flavor.
    #[must_use]
    pub fn is_vendor(&self) -> bool {
        self.s3_type.eq_ignore_ascii_case("tos")
    }

    /// Parses the INI text. Zero or missing numeric values fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] for malformed INI or values.
    pub fn from_ini_str(raw: &str) -> Result<Self, FilerError> {
        let doc = IniDocument::parse(raw)?;
        let section = doc.default_section();
        let mut cfg = Self::default();

        if let Some(value) = section.get("s3_type") {
            cfg.s3_type.clone_from(value);
        }
        cfg.endpoint = section.get("endpoint_url").filter(|v| !v.is_empty()).cloned();
        if let Some(value) = section.get("region") {
            cfg.region.clone_from(value);
        }
        if let Some(value) = parse_number::<u64>(section, "part_size")?
            && value > 0
        {
            cfg.part_size = value;
        }
        if let Some(value) = parse_number::<usize>(section, "task_num")?
            && value > 0
        {
            cfg.task_num = value;
        }
        if let Some(value) = section.get("enable_crc") {
            cfg.enable_crc = parse_bool(value)
                .ok_or_else(|| FilerError::invalid_argument("enable_crc", value.clone()))?;
        }
        if let Some(value) = parse_number::<u64>(section, "max_band_width")? {
            cfg.max_bandwidth = value;
        }
        if let Some(value) = parse_number::<u32>(section, "max_retry_count")?
            && value > 0
        {
            cfg.max_retry_count = value;
        }
        Ok(cfg)
    }

    /// Reads and parses the INI file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::Internal`] if the file cannot be read and
    /// [`FilerError::InvalidArgument`] if it is malformed.
    pub async fn load(path: &Path) -> Result<Self, FilerError> {
        Self::from_ini_str(&read_config_file(path).await?)
    }
}

/// Static secret material read from the shared credentials INI.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretConfig {
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl std::fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConfig")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl SecretConfig {
    /// Parses the `[default]` section of a credentials INI.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] for malformed INI.
    pub fn from_ini_str(raw: &str) -> Result<Self, FilerError> {
        let doc = IniDocument::parse(raw)?;
        let section = doc.default_section();
        let field = |key: &str| section.get(key).cloned().unwrap_or_default();
        Ok(Self {
            access_key: field("aws_access_key_id"),
            secret_key: field("aws_secret_access_key"),
            session_token: section
                .get("aws_session_token")
                .filter(|token| !token.is_empty())
                .cloned(),
        })
    }

    /// Reads and parses the credentials file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::Internal`] if the file cannot be read and
    /// [`FilerError::InvalidArgument`] if it is malformed.
    pub async fn load(path: &Path) -> Result<Self, FilerError> {
        Self::from_ini_str(&read_config_file(path).await?)
    }
}

async fn read_config_file(path: &Path) -> Result<String, FilerError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FilerError::internal("read config file", TransferError::io(path, e)))
}

/// Minimal INI document: `[section]` headers and `key = value` pairs.
///
/// Keys before the first header belong to the `default` section. Lines
/// starting with `#` or `;` are comments. Values may be wrapped in quotes.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    sections: HashMap<String, HashMap<String, String>>,
}

const DEFAULT_SECTION: &str = "default";

impl IniDocument {
    /// Parses INI text.
    ///
    /// # Errors
    ///
    /// Returns [`FilerError::InvalidArgument`] naming the first bad line.
    pub fn parse(raw: &str) -> Result<Self, FilerError> {
        let mut doc = Self::default();
        let mut current = DEFAULT_SECTION.to_string();
        for (line_index, raw_line) in raw.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let Some(name) = header.strip_suffix(']') else {
                    return Err(FilerError::invalid_argument(
                        "ini",
                        format!("unterminated section header on line {}", line_index + 1),
                    ));
                };
                current = name.trim().to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(FilerError::invalid_argument(
                    "ini",
                    format!("expected key = value on line {}", line_index + 1),
                ));
            };
            doc.sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_ascii_lowercase(), unquote(value.trim()).to_string());
        }
        Ok(doc)
    }

    /// Returns a section by name, if present.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(&name.to_ascii_lowercase())
    }

    fn default_section(&self) -> &HashMap<String, String> {
        static EMPTY: std::sync::OnceLock<HashMap<String, String>> = std::sync::OnceLock::new();
        self.section(DEFAULT_SECTION)
            .unwrap_or_else(|| EMPTY.get_or_init(HashMap::new))
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(
    section: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, FilerError> {
    let Some(raw) = section.get(key) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| FilerError::invalid_argument(key, raw.clone()))
}
