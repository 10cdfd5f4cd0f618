//! Target registry steps: authentication, blob pushes and the manifest push

use crate::cache::CachedLayer;
use crate::error::Result;
use crate::image::blob::BytesBlob;
use crate::image::digest::{BlobDescriptor, Digest};
use crate::image::model::Image;
use crate::logging::ProgressEventDispatcher;
use crate::registry::credential::{Authorization, Credential, retrieve_credential};
use crate::registry::transport::RequestBody;
use crate::steps::context::byte_progress;
use crate::steps::pull::BaseImage;
use crate::steps::runner::BuildResult;
use crate::steps::{AsyncStep, BuildContext};
use futures::future::try_join_all;
use std::sync::Arc;

pub fn retrieve_target_registry_credentials(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
) -> AsyncStep<Option<Credential>> {
    let context = context.clone();
    let token = context.cancellation().clone();
    let dispatcher = progress.new_child("retrieving target registry credentials", 1);
    AsyncStep::new("retrieve target registry credentials", &token, async move {
        let credential = retrieve_credential(context.configuration().target_image().credential_retrievers());
        dispatcher.close();
        credential
    })
}

/// Exchange the target credential for a push authorization
///
/// Registries without a bearer challenge get the credential as basic authentication.
pub fn authenticate_push(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    credential: &AsyncStep<Option<Credential>>,
) -> AsyncStep<Option<Authorization>> {
    let token = context.cancellation().clone();
    let context = context.clone();
    let dispatcher = progress.new_child("authenticating push", 1);
    credential.then("authenticate push", &token, move |credential| async move {
        let target = context.target_image();
        context
            .logger()
            .debug(&format!("Authenticating push to {}", target));
        let client = context.registry_client(target, None);
        let authorization = match client.get_registry_authenticator().await? {
            Some(authenticator) => Some(
                authenticator
                    .authenticate_push(credential.as_ref(), client.transport())
                    .await?,
            ),
            None => credential.as_ref().map(Authorization::from_credential),
        };
        dispatcher.close();
        Ok(authorization)
    })
}

/// Push every base image layer the target registry does not have yet
///
/// When the base image lives on the target registry the layers are mounted from its
/// repository instead of uploaded.
pub fn push_base_image_layers(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    authorization: &AsyncStep<Option<Authorization>>,
    base_image: &AsyncStep<BaseImage>,
    base_image_layers: &AsyncStep<Vec<CachedLayer>>,
) -> AsyncStep<Vec<BlobDescriptor>> {
    let context = context.clone();
    let token = context.cancellation().clone();
    let progress = progress.clone();
    let authorization = authorization.clone();
    let base_image = base_image.clone();
    let base_image_layers = base_image_layers.clone();
    AsyncStep::new("push base image layers", &token, async move {
        let authorization = authorization.get().await?;
        let base_image = base_image.get().await?;
        let layers = base_image_layers.get().await?;
        let source_repository = (base_image.reference.registry() == context.target_image().registry())
            .then(|| base_image.reference.repository().to_string());
        push_layers(&context, &progress, "pushing base image layers", authorization, layers, source_repository).await
    })
}

pub fn push_application_layers(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    authorization: &AsyncStep<Option<Authorization>>,
    application_layers: &AsyncStep<Vec<CachedLayer>>,
) -> AsyncStep<Vec<BlobDescriptor>> {
    let context = context.clone();
    let token = context.cancellation().clone();
    let progress = progress.clone();
    let authorization = authorization.clone();
    let application_layers = application_layers.clone();
    AsyncStep::new("push application layers", &token, async move {
        let authorization = authorization.get().await?;
        let layers = application_layers.get().await?;
        push_layers(&context, &progress, "pushing application layers", authorization, layers, None).await
    })
}

async fn push_layers(
    context: &BuildContext,
    progress: &ProgressEventDispatcher,
    description: &str,
    authorization: Option<Authorization>,
    layers: Vec<CachedLayer>,
    source_repository: Option<String>,
) -> Result<Vec<BlobDescriptor>> {
    let dispatcher = Arc::new(progress.new_child(description, layers.len() as u64));
    let steps: Vec<AsyncStep<BlobDescriptor>> = layers
        .into_iter()
        .map(|layer| {
            let context = context.clone();
            let token = context.cancellation().clone();
            let dispatcher = dispatcher.clone();
            let authorization = authorization.clone();
            let source_repository = source_repository.clone();
            AsyncStep::new("push layer", &token, async move {
                let layer_progress = Arc::new(dispatcher.new_child(format!("pushing {}", layer.digest()), layer.size()));
                push_blob(
                    &context,
                    authorization,
                    layer.blob_descriptor(),
                    layer.request_body(),
                    source_repository.as_deref(),
                    Some(layer_progress),
                )
                .await
            })
        })
        .collect();
    AsyncStep::all("push layers", context.cancellation(), steps).get().await
}

/// Push one blob unless the target already has it
async fn push_blob(
    context: &BuildContext,
    authorization: Option<Authorization>,
    descriptor: BlobDescriptor,
    body: RequestBody,
    source_repository: Option<&str>,
    progress: Option<Arc<ProgressEventDispatcher>>,
) -> Result<BlobDescriptor> {
    let logger = context.logger();
    let client = context.registry_client(context.target_image(), authorization);
    if client
        .check_blob(&descriptor.digest, Some(descriptor.size))
        .await?
        .is_some()
    {
        logger.info(&format!("Skipping push; BLOB already exists on target registry: {}", descriptor.digest));
        return Ok(descriptor);
    }

    let throttled = progress.map(byte_progress);
    let listener = throttled.as_ref().map(|(listener, _)| listener.clone());
    let existed = client
        .push_blob(&descriptor.digest, body, source_repository, listener)
        .await?;
    if let Some((_, throttled)) = throttled {
        throttled.flush();
    }
    if existed {
        logger.info(&format!("BLOB {} was mounted or already existed", descriptor.digest));
    } else {
        logger.debug(&format!(
            "Pushed BLOB {} ({})",
            descriptor.digest,
            logger.format_size(descriptor.size)
        ));
    }
    Ok(descriptor)
}

pub fn push_container_configuration(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    authorization: &AsyncStep<Option<Authorization>>,
    image: &AsyncStep<Image>,
) -> AsyncStep<BlobDescriptor> {
    let context = context.clone();
    let token = context.cancellation().clone();
    let dispatcher = progress.new_child("pushing container configuration", 1);
    let authorization = authorization.clone();
    let image = image.clone();
    AsyncStep::new("push container configuration", &token, async move {
        let authorization = authorization.get().await?;
        let image = image.get().await?;
        let blob = BytesBlob::json(&image.to_container_configuration())?;
        let descriptor = BlobDescriptor::new(Digest::of_bytes(blob.bytes()), blob.bytes().len() as u64);
        let body = RequestBody::Bytes(blob.bytes().clone());
        let pushed = push_blob(&context, authorization, descriptor, body, None, None).await;
        dispatcher.close();
        pushed
    })
}

/// Push the manifest under every target tag, concurrently, once all blobs are in place
#[allow(clippy::too_many_arguments)]
pub fn push_image(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    authorization: &AsyncStep<Option<Authorization>>,
    base_image_layer_pushes: &AsyncStep<Vec<BlobDescriptor>>,
    application_layer_pushes: &AsyncStep<Vec<BlobDescriptor>>,
    container_configuration_push: &AsyncStep<BlobDescriptor>,
    image: &AsyncStep<Image>,
) -> AsyncStep<BuildResult> {
    let context = context.clone();
    let token = context.cancellation().clone();
    let dispatcher = progress.new_child("pushing image manifest", 1);
    let authorization = authorization.clone();
    let base_image_layer_pushes = base_image_layer_pushes.clone();
    let application_layer_pushes = application_layer_pushes.clone();
    let container_configuration_push = container_configuration_push.clone();
    let image = image.clone();
    AsyncStep::new("push image", &token, async move {
        let authorization = authorization.get().await?;
        base_image_layer_pushes.get().await?;
        application_layer_pushes.get().await?;
        let container_configuration = container_configuration_push.get().await?;
        let image = image.get().await?;

        let configuration = context.configuration();
        let manifest = image.to_manifest(configuration.image_format(), &container_configuration);
        let target = context.target_image();
        let client = context.registry_client(target, authorization);
        let tags = configuration.all_target_tags();

        context.logger().lifecycle(&format!("Pushing manifest for {}...", target));
        let digests = try_join_all(tags.iter().map(|tag| client.push_manifest(&manifest, tag))).await?;
        dispatcher.close();

        let image_digest = match digests.into_iter().next() {
            Some(digest) => digest,
            None => manifest.digest()?,
        };
        Ok(BuildResult {
            image_digest,
            image_id: container_configuration.digest,
        })
    })
}
