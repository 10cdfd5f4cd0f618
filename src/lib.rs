//! Docker Image Builder Library
//!
//! Builds container images without a daemon: base image layers are pulled from a registry
//! and cached, application files are packed into reproducible layers, and the result is
//! pushed to a registry, loaded into a local engine or written as a tarball.
//!
//! A build is a graph of asynchronous steps driven by [`StepsRunner`]:
//!
//! ```no_run
//! use docker_image_builder::{
//!     BuildConfiguration, BuildContext, ImageConfiguration, ImageReference, ReqwestTransport, StepsRunner,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn build() -> docker_image_builder::Result<()> {
//! let configuration = BuildConfiguration::builder(
//!     ImageConfiguration::new(ImageReference::parse("alpine:3")?),
//!     ImageConfiguration::new(ImageReference::parse("registry.example.com/app:1.0")?),
//! )
//! .build()?;
//! let transport = Arc::new(ReqwestTransport::new("docker-image-builder", Duration::from_secs(20))?);
//! let context = BuildContext::new(configuration, transport)?;
//! let result = StepsRunner::for_build_to_registry(context).run().await?;
//! println!("pushed {}", result.image_digest);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod registry;
pub mod steps;

pub use cache::{Cache, CachedLayer};
pub use config::{BuildConfiguration, ContainerConfiguration, ImageConfiguration, ImageFormat, Port};
pub use error::{BuilderError, Result};
pub use image::{
    BlobDescriptor, CliDockerClient, Digest, DockerClient, Image, ImageReference, LayerConfiguration, LayerEntry,
};
pub use logging::{BuilderEvent, EventHandlers, LogEvent, LogLevel, Logger};
pub use registry::{Credential, CredentialRetriever, HttpTransport, RegistryClient, ReqwestTransport};
pub use steps::{BuildContext, BuildResult, StepsRunner};
