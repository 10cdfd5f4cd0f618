//! Base image steps: manifest and configuration pull, and per-layer pull into the cache

use crate::cache::{CachedLayer, ImageMetadata};
use crate::error::{BuilderError, Result};
use crate::image::container_config::ContainerConfigurationTemplate;
use crate::image::digest::Digest;
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;
use crate::logging::ProgressEventDispatcher;
use crate::registry::client::RegistryClient;
use crate::registry::credential::{Authorization, retrieve_credential};
use crate::registry::operations::{ByteCountListener, ManifestAndDigest};
use crate::steps::context::blob_pull_progress;
use crate::steps::{AsyncStep, BuildContext};
use std::sync::Arc;

/// The resolved base image
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageReference,
    /// `None` for `scratch`
    pub manifest: Option<ManifestAndDigest>,
    pub container_configuration: Option<ContainerConfigurationTemplate>,
    /// What the registry accepted for the manifest pull; reused for the layer pulls
    pub authorization: Option<Authorization>,
}

impl BaseImage {
    fn scratch(reference: ImageReference) -> Self {
        Self {
            reference,
            manifest: None,
            container_configuration: None,
            authorization: None,
        }
    }

    fn from_metadata(reference: ImageReference, metadata: ImageMetadata) -> Self {
        Self {
            reference,
            manifest: Some(ManifestAndDigest {
                manifest: metadata.manifest,
                digest: metadata.manifest_digest,
            }),
            container_configuration: metadata.container_configuration,
            authorization: None,
        }
    }

    /// Layer digests from the bottom up, with sizes when known
    pub fn layers(&self) -> Vec<(Digest, Option<u64>)> {
        self.manifest
            .as_ref()
            .map(|pulled| pulled.manifest.layers())
            .unwrap_or_default()
    }
}

pub fn pull_base_image(context: &BuildContext, progress: &Arc<ProgressEventDispatcher>) -> AsyncStep<BaseImage> {
    let token = context.cancellation().clone();
    let context = context.clone();
    let dispatcher = progress.new_child("pulling base image manifest", 1);
    AsyncStep::new("pull base image", &token, async move {
        let base_image = resolve_base_image(&context).await;
        dispatcher.close();
        base_image
    })
}

async fn resolve_base_image(context: &BuildContext) -> Result<BaseImage> {
    let reference = context.base_image().clone();
    let logger = context.logger();
    if reference.is_scratch() {
        logger.lifecycle("Getting scratch base image...");
        return Ok(BaseImage::scratch(reference));
    }

    let cache = context.base_image_layers_cache();
    if context.configuration().is_offline() {
        let Some(metadata) = cache.retrieve_metadata(&reference)? else {
            return Err(BuilderError::InvalidConfiguration(format!(
                "cannot run offline: base image {} is not in the cache",
                reference
            )));
        };
        logger.info(&format!("Using cached base image {} (offline)", reference));
        return Ok(BaseImage::from_metadata(reference, metadata));
    }
    if let Some(digest) = reference.digest() {
        if let Some(metadata) = cache.retrieve_metadata(&reference)? {
            if &metadata.manifest_digest == digest {
                logger.info(&format!("Using cached base image {}", reference));
                return Ok(BaseImage::from_metadata(reference, metadata));
            }
        }
    }

    logger.lifecycle(&format!("Getting manifest for base image {}...", reference));
    let client = context.registry_client(&reference, None);

    let anonymous_error = match pull_manifest_and_configuration(&client, &reference).await {
        Ok(pulled) => return finish(context, reference, pulled, None),
        Err(e) if needs_credentials(&e) => e,
        Err(e) => return Err(e),
    };

    let credential = retrieve_credential(context.configuration().base_image().credential_retrievers())?;
    if let Some(credential) = credential.as_ref().filter(|c| !c.is_oauth2_refresh_token()) {
        logger.debug(&format!("Trying basic authentication for base image {}", reference));
        let authorization = Authorization::from_credential(credential);
        client.set_authorization(Some(authorization.clone()));
        match pull_manifest_and_configuration(&client, &reference).await {
            Ok(pulled) => return finish(context, reference, pulled, Some(authorization)),
            Err(e) if needs_credentials(&e) => {}
            Err(e) => return Err(e),
        }
    }

    logger.debug(&format!("Trying bearer authentication for base image {}", reference));
    client.set_authorization(None);
    let Some(authenticator) = client.get_registry_authenticator().await? else {
        return Err(anonymous_error);
    };
    let authorization = authenticator
        .authenticate_pull(credential.as_ref(), client.transport())
        .await?;
    client.set_authorization(Some(authorization.clone()));
    let pulled = pull_manifest_and_configuration(&client, &reference).await?;
    finish(context, reference, pulled, Some(authorization))
}

fn needs_credentials(error: &BuilderError) -> bool {
    matches!(
        error,
        BuilderError::Unauthorized { .. } | BuilderError::CredentialsNotSent { .. }
    )
}

async fn pull_manifest_and_configuration(
    client: &RegistryClient,
    reference: &ImageReference,
) -> Result<(ManifestAndDigest, Option<ContainerConfigurationTemplate>)> {
    let pulled = client.pull_manifest(&reference.qualifier()).await?;
    if let ManifestTemplate::V21(manifest) = &pulled.manifest {
        let configuration = manifest.container_configuration()?;
        return Ok((pulled, configuration));
    }
    let Some(descriptor) = pulled.manifest.container_configuration() else {
        return Ok((pulled, None));
    };

    let mut buffer = Vec::new();
    let ignore: ByteCountListener = Arc::new(|_| {});
    client
        .pull_blob(&descriptor.digest, &mut buffer, ignore.clone(), ignore)
        .await?;
    let configuration = serde_json::from_slice(&buffer)?;
    Ok((pulled, Some(configuration)))
}

fn finish(
    context: &BuildContext,
    reference: ImageReference,
    (pulled, configuration): (ManifestAndDigest, Option<ContainerConfigurationTemplate>),
    authorization: Option<Authorization>,
) -> Result<BaseImage> {
    context.base_image_layers_cache().write_metadata(
        &reference,
        &pulled.manifest,
        &pulled.digest,
        configuration.as_ref(),
    )?;
    Ok(BaseImage {
        reference,
        manifest: Some(pulled),
        container_configuration: configuration,
        authorization,
    })
}

/// One child step per base layer, run concurrently; results keep the manifest order
pub fn pull_and_cache_base_image_layers(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    base_image: &AsyncStep<BaseImage>,
) -> AsyncStep<Vec<CachedLayer>> {
    let token = context.cancellation().clone();
    let context = context.clone();
    let progress = progress.clone();
    base_image.then("pull base image layers", &token, move |base_image| async move {
        let layers = base_image.layers();
        let dispatcher = Arc::new(progress.new_child("pulling base image layers", layers.len() as u64));
        let steps = layers
            .into_iter()
            .map(|(digest, size)| {
                let context = context.clone();
                let token = context.cancellation().clone();
                let base_image = base_image.clone();
                let dispatcher = dispatcher.clone();
                AsyncStep::new("pull base image layer", &token, async move {
                    pull_and_cache_layer(&context, &base_image, &digest, size, &dispatcher).await
                })
            })
            .collect();
        AsyncStep::all("pull base image layers", context.cancellation(), steps)
            .get()
            .await
    })
}

async fn pull_and_cache_layer(
    context: &BuildContext,
    base_image: &BaseImage,
    digest: &Digest,
    size: Option<u64>,
    progress: &Arc<ProgressEventDispatcher>,
) -> Result<CachedLayer> {
    let logger = context.logger();
    let cache = context.base_image_layers_cache();
    if let Some(layer) = cache.retrieve_by_digest(digest)? {
        logger.debug(&format!("Base image layer {} is cached", digest));
        progress.dispatch_progress(1);
        return Ok(layer);
    }
    if context.configuration().is_offline() {
        return Err(BuilderError::InvalidConfiguration(format!(
            "cannot run offline: layer {} of base image {} is not in the cache",
            digest, base_image.reference
        )));
    }

    logger.info(&format!("Pulling base image layer {}", digest));
    let (size_listener, write_listener, throttled) =
        blob_pull_progress(progress.clone(), format!("pulling layer {}", digest), size);
    let client = context.registry_client(&base_image.reference, base_image.authorization.clone());

    let layer = cache
        .write_compressed_layer(|file| async move {
            client.pull_blob(digest, file, size_listener, write_listener).await
        })
        .await?;
    throttled.flush();
    logger.debug(&format!(
        "Pulled base image layer {} ({})",
        digest,
        logger.format_size(layer.size())
    ));
    Ok(layer)
}
