//! Scheme-keyed transport cache.
//!
//! Each scheme gets one transport per process, built on first use. Concurrent
//! first uses of the same scheme wait on a shared [`OnceCell`] so the
//! transport is constructed exactly once. A failed construction is not
//! cached; the next caller tries again.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use super::drs::DrsTransport;
use super::ftp::FtpTransport;
use super::http::HttpTransport;
use super::local::LocalMountTransport;
use super::object::{ObjectFlavor, ObjectStoreTransport};
use super::Transport;
use crate::config::{FilerConfig, ObjectStoreConfig, env};
use crate::credentials::resolve_provider;
use crate::error::FilerError;
use crate::manifest::{EmbeddedCredentials, Scheme};

/// Builds a transport for a scheme.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Constructs the transport for `scheme`.
    ///
    /// `credentials` are the ones embedded in the URL of the entity that
    /// triggered construction, if any.
    async fn create(
        &self,
        scheme: Scheme,
        credentials: Option<&EmbeddedCredentials>,
    ) -> Result<Arc<dyn Transport>, FilerError>;
}

/// Factory reading scheme settings from [`FilerConfig`].
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    config: FilerConfig,
}

impl DefaultTransportFactory {
    /// Creates a factory over `config`.
    #[must_use]
    pub fn new(config: FilerConfig) -> Self {
        Self { config }
    }

    async fn object_store(
        &self,
        scheme: Scheme,
        credentials: Option<&EmbeddedCredentials>,
    ) -> Result<ObjectStoreTransport, FilerError> {
        let Some(config_file) = self.config.object_store.config_file.as_deref() else {
            return Err(FilerError::invalid_argument(env::S3_CONFIG_FILE, "not set"));
        };
        let store = ObjectStoreConfig::load(config_file).await?;
        let (kind, provider) = resolve_provider(&self.config.object_store, credentials).await?;
        let flavor = if store.is_vendor() || scheme == Scheme::Tos {
            ObjectFlavor::Vendor
        } else {
            ObjectFlavor::Generic
        };
        debug!(?kind, flavor = flavor.name(), "object storage credentials selected");
        Ok(ObjectStoreTransport::new(&store, provider, flavor))
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        scheme: Scheme,
        credentials: Option<&EmbeddedCredentials>,
    ) -> Result<Arc<dyn Transport>, FilerError> {
        let context = || format!("create {scheme} transport");
        let transport: Arc<dyn Transport> = match scheme {
            Scheme::S3 | Scheme::Tos => Arc::new(self.object_store(scheme, credentials).await?),
            Scheme::Http => {
                Arc::new(HttpTransport::new().map_err(|e| FilerError::internal(context(), e))?)
            }
            Scheme::Ftp => Arc::new(
                FtpTransport::connect(&self.config.ftp)
                    .await
                    .map_err(|e| FilerError::internal(context(), e))?,
            ),
            Scheme::Drs => Arc::new(
                DrsTransport::new(&self.config.drs).map_err(|e| FilerError::internal(context(), e))?,
            ),
            Scheme::File => Arc::new(LocalMountTransport::new(&self.config.local_mount)),
        };
        Ok(transport)
    }
}

/// Lazily constructed transports, one per scheme.
pub struct TransportRegistry {
    factory: Arc<dyn TransportFactory>,
    transports: DashMap<Scheme, Arc<OnceCell<Arc<dyn Transport>>>>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.transports.len())
            .finish_non_exhaustive()
    }
}

impl TransportRegistry {
    /// Creates an empty registry backed by `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            transports: DashMap::new(),
        }
    }

    /// Returns the transport for `scheme`, constructing it on first use.
    ///
    /// Embedded credentials only matter for the call that constructs the
    /// transport; later calls reuse it whatever their credentials.
    ///
    /// # Errors
    ///
    /// Returns the factory's error. Nothing is cached on failure.
    #[instrument(skip_all, fields(%scheme))]
    pub async fn get(
        &self,
        scheme: Scheme,
        credentials: Option<&EmbeddedCredentials>,
    ) -> Result<Arc<dyn Transport>, FilerError> {
        // Clone the cell out so the DashMap shard lock is not held across the await.
        let cell = self.transports.entry(scheme).or_default().clone();
        let transport = cell
            .get_or_try_init(|| async {
                info!("creating transport");
                self.factory.create(scheme, credentials).await
            })
            .await?;
        Ok(Arc::clone(transport))
    }
}
