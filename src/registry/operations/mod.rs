//! Registry endpoint operations
//!
//! Each operation is a [`RegistryEndpointProvider`](crate::registry::caller::RegistryEndpointProvider):
//! it knows its method, route, body and how to read the registry's answer, and leaves the
//! connection policy to the endpoint caller.

pub mod auth_operations;
pub mod blob_operations;
pub mod manifest_operations;

pub use auth_operations::AuthenticationMethodRetriever;
pub use blob_operations::{
    BlobChecker, BlobPushCommitter, BlobPushInitializer, BlobPushWriter, BlobPuller, ByteCountListener,
};
pub use manifest_operations::{DOCKER_CONTENT_DIGEST, ManifestAndDigest, ManifestPuller, ManifestPusher};
