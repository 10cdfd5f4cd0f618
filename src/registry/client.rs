//! Registry client for one repository
//!
//! Wraps the endpoint operations behind plain async methods and holds the authorization
//! used for every call. The authorization can be replaced at any time, which is how the
//! pull and push steps install a bearer token after authenticating.

use crate::config::BuildConfiguration;
use crate::error::Result;
use crate::image::digest::{BlobDescriptor, Digest};
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::registry::auth::RegistryAuthenticator;
use crate::registry::caller::{
    CallerSettings, RegistryEndpointCaller, RegistryEndpointProvider, RegistryEndpointRequestProperties,
};
use crate::registry::credential::Authorization;
use crate::registry::operations::{
    AuthenticationMethodRetriever, BlobChecker, BlobPushCommitter, BlobPushInitializer, BlobPushWriter,
    BlobPuller, ByteCountListener, ManifestAndDigest, ManifestPuller, ManifestPusher,
};
use crate::registry::transport::{HttpTransport, RequestBody};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWrite;

pub struct RegistryClientBuilder {
    transport: Arc<dyn HttpTransport>,
    properties: RegistryEndpointRequestProperties,
    settings: CallerSettings,
    logger: Logger,
    authorization: Option<Authorization>,
}

impl RegistryClientBuilder {
    pub fn new(transport: Arc<dyn HttpTransport>, server_url: &str, image_name: &str) -> Self {
        Self {
            transport,
            properties: RegistryEndpointRequestProperties::new(server_url, image_name),
            settings: CallerSettings::default(),
            logger: Logger::silent(),
            authorization: None,
        }
    }

    pub fn with_settings(mut self, settings: CallerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_authorization(mut self, authorization: Option<Authorization>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn build(self) -> RegistryClient {
        RegistryClient {
            transport: self.transport,
            properties: self.properties,
            settings: self.settings,
            logger: self.logger,
            authorization: RwLock::new(self.authorization),
        }
    }
}

pub struct RegistryClient {
    transport: Arc<dyn HttpTransport>,
    properties: RegistryEndpointRequestProperties,
    settings: CallerSettings,
    logger: Logger,
    authorization: RwLock<Option<Authorization>>,
}

impl RegistryClient {
    pub fn builder(transport: Arc<dyn HttpTransport>, server_url: &str, image_name: &str) -> RegistryClientBuilder {
        RegistryClientBuilder::new(transport, server_url, image_name)
    }

    /// Client for `image` using the connection policy and logger of a build
    pub fn for_image(
        configuration: &BuildConfiguration,
        transport: Arc<dyn HttpTransport>,
        image: &ImageReference,
    ) -> RegistryClient {
        Self::builder(transport, image.registry(), image.repository())
            .with_settings(CallerSettings {
                allow_insecure_registries: configuration.allow_insecure_registries(),
                send_credentials_over_http: configuration.send_credentials_over_http(),
                max_redirects: configuration.max_redirects(),
            })
            .with_logger(configuration.logger().clone())
            .build()
    }

    pub fn properties(&self) -> &RegistryEndpointRequestProperties {
        &self.properties
    }

    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    pub fn authorization(&self) -> Option<Authorization> {
        self.authorization
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_authorization(&self, authorization: Option<Authorization>) {
        *self.authorization.write().unwrap_or_else(|e| e.into_inner()) = authorization;
    }

    /// `None` when the registry needs no token exchange
    pub async fn get_registry_authenticator(&self) -> Result<Option<RegistryAuthenticator>> {
        let authenticator = self
            .call(&AuthenticationMethodRetriever::new(&self.properties))
            .await?;
        Ok(authenticator.map(|authenticator| authenticator.with_insecure(self.settings.allow_insecure_registries)))
    }

    pub async fn pull_manifest(&self, qualifier: &str) -> Result<ManifestAndDigest> {
        self.call(&ManifestPuller::new(&self.properties, qualifier)).await
    }

    /// Push under `tag` and return the digest of the pushed bytes
    pub async fn push_manifest(&self, manifest: &ManifestTemplate, tag: &str) -> Result<Digest> {
        let pusher = ManifestPusher::new(&self.properties, manifest, tag, &self.logger)?;
        self.call(&pusher).await
    }

    pub async fn check_blob(&self, digest: &Digest, expected_size: Option<u64>) -> Result<Option<BlobDescriptor>> {
        self.call(&BlobChecker::new(&self.properties, digest, expected_size)).await
    }

    pub async fn pull_blob<W>(
        &self,
        digest: &Digest,
        destination: W,
        size_listener: ByteCountListener,
        write_listener: ByteCountListener,
    ) -> Result<BlobDescriptor>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let puller = BlobPuller::new(&self.properties, digest, destination, size_listener, write_listener);
        self.call(&puller).await
    }

    /// Upload a blob, letting the registry mount it from `source_repository` when it can
    ///
    /// Returns `true` when the registry already had the blob and nothing was uploaded.
    pub async fn push_blob(
        &self,
        digest: &Digest,
        blob: RequestBody,
        source_repository: Option<&str>,
        progress: Option<ByteCountListener>,
    ) -> Result<bool> {
        let initializer = BlobPushInitializer::new(&self.properties, digest, source_repository, &self.logger);
        let Some(location) = self.call(&initializer).await? else {
            return Ok(true);
        };

        let writer = BlobPushWriter::new(&self.properties, digest, location, blob, progress);
        let location = self.call(&writer).await?;

        self.call(&BlobPushCommitter::new(&self.properties, digest, location))
            .await?;
        Ok(false)
    }

    async fn call<P: RegistryEndpointProvider>(&self, provider: &P) -> Result<P::Output> {
        RegistryEndpointCaller::new(
            self.transport.clone(),
            self.settings,
            &self.logger,
            &self.properties,
            self.authorization(),
            provider,
        )
        .call()
        .await
    }
}
