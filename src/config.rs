//! Build configuration
//!
//! A [`BuildConfiguration`] is assembled once through [`BuildConfigurationBuilder`] and then
//! shared read-only by every build step. Defaults live here and are only consulted by the
//! builder.

use crate::error::{BuilderError, Result};
use crate::image::layer::LayerConfiguration;
use crate::image::reference::ImageReference;
use crate::logging::{EventHandlers, Logger};
use crate::registry::credential::CredentialRetriever;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TOOL_NAME: &str = "docker-image-builder";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

const CACHE_DIRECTORY_NAME: &str = "docker-image-builder";
const APPLICATION_LAYERS_DIRECTORY_NAME: &str = "application-layers";

/// Shared base-image layer cache under the user cache directory
pub fn default_base_image_layers_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_DIRECTORY_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// An exposed container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    number: u16,
    protocol: Protocol,
}

impl Port {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Udp,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Expand a port specification: `8080`, `1000-1003`, `53/udp` or `1000-1003/udp`
    pub fn parse_range(spec: &str) -> Result<Vec<Port>> {
        let invalid = |reason: &str| BuilderError::InvalidPortRange(format!("'{}': {}", spec, reason));

        let (range, protocol) = match spec.trim().split_once('/') {
            Some((range, protocol)) => (range, protocol),
            None => (spec.trim(), "tcp"),
        };
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(invalid("protocol must be tcp or udp")),
        };

        let parse = |number: &str| -> Result<u16> {
            match number.trim().parse::<u16>() {
                Ok(0) | Err(_) => Err(invalid("ports must be between 1 and 65535")),
                Ok(port) => Ok(port),
            }
        };
        let (min, max) = match range.split_once('-') {
            Some((min, max)) => (parse(min)?, parse(max)?),
            None => {
                let port = parse(range)?;
                (port, port)
            }
        };
        if min > max {
            return Err(invalid("range start is greater than its end"));
        }
        Ok((min..=max).map(|number| Port { number, protocol }).collect())
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

impl FromStr for Port {
    type Err = BuilderError;

    /// A single port, as found in the `ExposedPorts` keys of a container configuration
    fn from_str(s: &str) -> Result<Self> {
        match Port::parse_range(s)?.as_slice() {
            [port] => Ok(*port),
            _ => Err(BuilderError::InvalidPortRange(format!("'{}' is not a single port", s))),
        }
    }
}

/// Manifest format the built image is pushed in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageFormat {
    #[default]
    Docker,
    Oci,
}

/// An image together with the chain of credential sources for its registry
#[derive(Clone)]
pub struct ImageConfiguration {
    image: ImageReference,
    credential_retrievers: Vec<Arc<dyn CredentialRetriever>>,
}

impl ImageConfiguration {
    pub fn new(image: ImageReference) -> Self {
        Self {
            image,
            credential_retrievers: Vec::new(),
        }
    }

    /// Retrievers are tried in the order they are added
    pub fn with_credential_retriever(mut self, retriever: impl CredentialRetriever + 'static) -> Self {
        self.credential_retrievers.push(Arc::new(retriever));
        self
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn credential_retrievers(&self) -> &[Arc<dyn CredentialRetriever>] {
        &self.credential_retrievers
    }
}

impl fmt::Debug for ImageConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageConfiguration")
            .field("image", &self.image)
            .field("credential_retrievers", &self.credential_retrievers.len())
            .finish()
    }
}

/// Runtime settings of the built container
///
/// `None` for entrypoint or program arguments means "not set here"; see the image
/// assembly step for how they are then inherited from the base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfiguration {
    pub creation_time: DateTime<Utc>,
    pub entrypoint: Option<Vec<String>>,
    pub program_arguments: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<Port>,
    pub volumes: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub user: Option<String>,
    pub working_directory: Option<String>,
}

impl Default for ContainerConfiguration {
    fn default() -> Self {
        Self {
            creation_time: DateTime::<Utc>::UNIX_EPOCH,
            entrypoint: None,
            program_arguments: None,
            environment: BTreeMap::new(),
            exposed_ports: BTreeSet::new(),
            volumes: BTreeSet::new(),
            labels: BTreeMap::new(),
            user: None,
            working_directory: None,
        }
    }
}

/// Immutable settings for one build
#[derive(Debug)]
pub struct BuildConfiguration {
    base_image: ImageConfiguration,
    target_image: ImageConfiguration,
    additional_target_tags: BTreeSet<String>,
    container_configuration: ContainerConfiguration,
    layer_configurations: Vec<LayerConfiguration>,
    base_image_layers_cache_directory: PathBuf,
    application_layers_cache_directory: PathBuf,
    allow_insecure_registries: bool,
    send_credentials_over_http: bool,
    offline: bool,
    image_format: ImageFormat,
    tool_name: String,
    http_timeout: Duration,
    max_redirects: usize,
    logger: Logger,
}

impl BuildConfiguration {
    pub fn builder(base_image: ImageConfiguration, target_image: ImageConfiguration) -> BuildConfigurationBuilder {
        BuildConfigurationBuilder::new(base_image, target_image)
    }

    pub fn base_image(&self) -> &ImageConfiguration {
        &self.base_image
    }

    pub fn target_image(&self) -> &ImageConfiguration {
        &self.target_image
    }

    /// Every tag the target image is published under, the reference's own tag first
    pub fn all_target_tags(&self) -> Vec<String> {
        let mut tags = vec![self.target_image.image().qualifier()];
        for tag in &self.additional_target_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    pub fn container_configuration(&self) -> &ContainerConfiguration {
        &self.container_configuration
    }

    pub fn layer_configurations(&self) -> &[LayerConfiguration] {
        &self.layer_configurations
    }

    pub fn base_image_layers_cache_directory(&self) -> &Path {
        &self.base_image_layers_cache_directory
    }

    pub fn application_layers_cache_directory(&self) -> &Path {
        &self.application_layers_cache_directory
    }

    pub fn allow_insecure_registries(&self) -> bool {
        self.allow_insecure_registries
    }

    pub fn send_credentials_over_http(&self) -> bool {
        self.send_credentials_over_http
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn image_format(&self) -> ImageFormat {
        self.image_format
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

pub struct BuildConfigurationBuilder {
    base_image: ImageConfiguration,
    target_image: ImageConfiguration,
    additional_target_tags: BTreeSet<String>,
    container_configuration: ContainerConfiguration,
    layer_configurations: Vec<LayerConfiguration>,
    base_image_layers_cache_directory: Option<PathBuf>,
    application_layers_cache_directory: Option<PathBuf>,
    allow_insecure_registries: bool,
    send_credentials_over_http: bool,
    offline: bool,
    image_format: ImageFormat,
    tool_name: String,
    http_timeout: Duration,
    max_redirects: usize,
    event_handlers: EventHandlers,
}

impl BuildConfigurationBuilder {
    pub fn new(base_image: ImageConfiguration, target_image: ImageConfiguration) -> Self {
        Self {
            base_image,
            target_image,
            additional_target_tags: BTreeSet::new(),
            container_configuration: ContainerConfiguration::default(),
            layer_configurations: Vec::new(),
            base_image_layers_cache_directory: None,
            application_layers_cache_directory: None,
            allow_insecure_registries: false,
            send_credentials_over_http: false,
            offline: false,
            image_format: ImageFormat::default(),
            tool_name: DEFAULT_TOOL_NAME.to_string(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            event_handlers: EventHandlers::new(),
        }
    }

    pub fn additional_target_tag(mut self, tag: impl Into<String>) -> Self {
        self.additional_target_tags.insert(tag.into());
        self
    }

    pub fn container_configuration(mut self, container_configuration: ContainerConfiguration) -> Self {
        self.container_configuration = container_configuration;
        self
    }

    pub fn layer_configuration(mut self, layer: LayerConfiguration) -> Self {
        self.layer_configurations.push(layer);
        self
    }

    pub fn base_image_layers_cache_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.base_image_layers_cache_directory = Some(directory.into());
        self
    }

    pub fn application_layers_cache_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.application_layers_cache_directory = Some(directory.into());
        self
    }

    pub fn allow_insecure_registries(mut self, allow: bool) -> Self {
        self.allow_insecure_registries = allow;
        self
    }

    pub fn send_credentials_over_http(mut self, send: bool) -> Self {
        self.send_credentials_over_http = send;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn image_format(mut self, format: ImageFormat) -> Self {
        self.image_format = format;
        self
    }

    pub fn tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = tool_name.into();
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    pub fn build(self) -> Result<BuildConfiguration> {
        if self.target_image.image().is_scratch() {
            return Err(BuilderError::InvalidConfiguration(
                "the target image cannot be 'scratch'".to_string(),
            ));
        }
        for tag in &self.additional_target_tags {
            self.target_image.image().with_tag(tag)?;
        }
        if self.tool_name.trim().is_empty() {
            return Err(BuilderError::InvalidConfiguration("tool name is empty".to_string()));
        }

        let base_image_layers_cache_directory = self
            .base_image_layers_cache_directory
            .unwrap_or_else(default_base_image_layers_cache_directory);
        let application_layers_cache_directory = self
            .application_layers_cache_directory
            .unwrap_or_else(|| base_image_layers_cache_directory.join(APPLICATION_LAYERS_DIRECTORY_NAME));

        Ok(BuildConfiguration {
            base_image: self.base_image,
            target_image: self.target_image,
            additional_target_tags: self.additional_target_tags,
            container_configuration: self.container_configuration,
            layer_configurations: self.layer_configurations,
            base_image_layers_cache_directory,
            application_layers_cache_directory,
            allow_insecure_registries: self.allow_insecure_registries,
            send_credentials_over_http: self.send_credentials_over_http,
            offline: self.offline,
            image_format: self.image_format,
            tool_name: self.tool_name,
            http_timeout: self.http_timeout,
            max_redirects: self.max_redirects,
            logger: Logger::new(self.event_handlers),
        })
    }
}
