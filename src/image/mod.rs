//! Image data model
//!
//! Content addressing ([`digest`]), blob sources ([`blob`]), image references, the manifest
//! and container configuration JSON templates, layer entries with the reproducible layer
//! builder, the in-memory [`Image`] and its `docker load` tarball form.

pub mod blob;
pub mod container_config;
pub mod digest;
pub mod layer;
pub mod manifest;
pub mod model;
pub mod reference;
pub mod tarball;

pub use blob::{Blob, BytesBlob, FileBlob};
pub use digest::{BlobDescriptor, Digest};
pub use layer::{LayerConfiguration, LayerEntry, ReproducibleLayerBuilder};
pub use manifest::ManifestTemplate;
pub use model::Image;
pub use reference::ImageReference;
pub use tarball::{CliDockerClient, DockerClient, ImageTarball};
