//! Application layer steps and image assembly

use crate::cache::CachedLayer;
use crate::config::{BuildConfiguration, ContainerConfiguration};
use crate::error::Result;
use crate::image::container_config::HistoryEntryTemplate;
use crate::image::layer::{LayerConfiguration, ReproducibleLayerBuilder};
use crate::image::model::Image;
use crate::logging::{Logger, ProgressEventDispatcher};
use crate::steps::pull::BaseImage;
use crate::steps::{AsyncStep, BuildContext};
use chrono::SecondsFormat;
use std::sync::Arc;

/// One child step per non-empty layer configuration, run concurrently
pub fn build_and_cache_application_layers(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
) -> AsyncStep<Vec<CachedLayer>> {
    let layers = application_layer_configurations(context.configuration());
    let dispatcher = Arc::new(progress.new_child("building application layers", layers.len() as u64));
    let steps = layers
        .into_iter()
        .map(|layer| {
            let context = context.clone();
            let token = context.cancellation().clone();
            let dispatcher = dispatcher.clone();
            AsyncStep::new("build application layer", &token, async move {
                let cached = build_and_cache_layer(&context, &layer).await;
                dispatcher.dispatch_progress(1);
                cached
            })
        })
        .collect();
    AsyncStep::all("build application layers", context.cancellation(), steps)
}

fn application_layer_configurations(configuration: &BuildConfiguration) -> Vec<LayerConfiguration> {
    configuration
        .layer_configurations()
        .iter()
        .filter(|layer| !layer.is_empty())
        .cloned()
        .collect()
}

async fn build_and_cache_layer(context: &BuildContext, layer: &LayerConfiguration) -> Result<CachedLayer> {
    let logger = context.logger();
    let cache = context.application_layers_cache().clone();
    let entries = layer.entries().to_vec();

    let lookup = cache.clone();
    let lookup_entries = entries.clone();
    let cached = tokio::task::spawn_blocking(move || lookup.retrieve_by_entries(&lookup_entries)).await??;
    if let Some(cached) = cached {
        logger.debug(&format!("Skipping {} layer; it is already cached as {}", layer.name(), cached.digest()));
        return Ok(cached);
    }

    logger.progress(&format!("Building {} layer...", layer.name()));
    let builder = ReproducibleLayerBuilder::new(&entries);
    let built = cache.write_uncompressed_layer(Box::new(builder), entries).await?;
    logger.debug(&format!("Built {} layer {}", layer.name(), built.digest()));
    Ok(built)
}

/// Merge the base image, its layers and the application layers into the final image
pub fn build_image(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    base_image: &AsyncStep<BaseImage>,
    base_image_layers: &AsyncStep<Vec<CachedLayer>>,
    application_layers: &AsyncStep<Vec<CachedLayer>>,
) -> AsyncStep<Image> {
    let context = context.clone();
    let token = context.cancellation().clone();
    let dispatcher = progress.new_child("building image format", 1);
    let base_image = base_image.clone();
    let base_image_layers = base_image_layers.clone();
    let application_layers = application_layers.clone();
    AsyncStep::new("build image", &token, async move {
        let base_image = base_image.get().await?;
        let base_image_layers = base_image_layers.get().await?;
        let application_layers = application_layers.get().await?;
        context.logger().progress("Building container configuration...");
        let image = assemble_image(
            context.configuration(),
            &base_image,
            base_image_layers,
            application_layers,
        );
        dispatcher.close();
        image
    })
}

pub fn assemble_image(
    configuration: &BuildConfiguration,
    base_image: &BaseImage,
    base_image_layers: Vec<CachedLayer>,
    application_layers: Vec<CachedLayer>,
) -> Result<Image> {
    let mut image =
        Image::from_container_configuration(base_image.container_configuration.as_ref(), base_image_layers)?;
    let container = configuration.container_configuration();
    let created = container.creation_time;

    image.created = Some(created);
    image.environment.extend(container.environment.clone());
    image.labels.extend(container.labels.clone());
    image.exposed_ports.extend(container.exposed_ports.iter().copied());
    image.volumes.extend(container.volumes.iter().cloned());
    if container.user.is_some() {
        image.user = container.user.clone();
    }
    if container.working_directory.is_some() {
        image.working_directory = container.working_directory.clone();
    }

    let layer_names = application_layer_configurations(configuration)
        .into_iter()
        .map(|layer| layer.name().to_string());
    for (layer, name) in application_layers.into_iter().zip(layer_names) {
        image.layers.push(layer);
        image.history.push(HistoryEntryTemplate {
            created: Some(created.to_rfc3339_opts(SecondsFormat::Secs, true)),
            author: Some(configuration.tool_name().to_string()),
            created_by: Some(configuration.tool_name().to_string()),
            comment: Some(name),
            empty_layer: None,
        });
    }

    let (entrypoint, program_arguments) = resolve_command(
        container,
        image.entrypoint.take(),
        image.program_arguments.take(),
        configuration.logger(),
    );
    image.entrypoint = entrypoint;
    image.program_arguments = program_arguments;
    Ok(image)
}

/// Decide the entrypoint and program arguments of the built image
///
/// An unset entrypoint is inherited from the base image. Program arguments are inherited
/// only when both are unset, since base arguments belong to the base entrypoint.
pub fn resolve_command(
    container: &ContainerConfiguration,
    base_entrypoint: Option<Vec<String>>,
    base_program_arguments: Option<Vec<String>>,
    logger: &Logger,
) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let entrypoint = match &container.entrypoint {
        Some(entrypoint) => {
            logger.lifecycle(&format!("Container entrypoint set to {}", command_line(entrypoint)));
            Some(entrypoint.clone())
        }
        None => {
            if let Some(entrypoint) = &base_entrypoint {
                logger.lifecycle(&format!(
                    "Container entrypoint set to {} (inherited from base image)",
                    command_line(entrypoint)
                ));
            }
            base_entrypoint
        }
    };

    let program_arguments = match (&container.entrypoint, &container.program_arguments) {
        (_, Some(arguments)) => {
            logger.lifecycle(&format!("Container program arguments set to {}", command_line(arguments)));
            Some(arguments.clone())
        }
        (None, None) => {
            if let Some(arguments) = &base_program_arguments {
                logger.lifecycle(&format!(
                    "Container program arguments set to {} (inherited from base image)",
                    command_line(arguments)
                ));
            }
            base_program_arguments
        }
        (Some(_), None) => None,
    };

    (entrypoint, program_arguments)
}

fn command_line(arguments: &[String]) -> String {
    format!("[{}]", arguments.join(", "))
}
