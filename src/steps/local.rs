//! Steps for the local targets: loading into a container engine and writing a tarball

use crate::error::Result;
use crate::image::blob::BytesBlob;
use crate::image::digest::{BlobDescriptor, Digest};
use crate::image::model::Image;
use crate::image::tarball::{DockerClient, ImageTarball};
use crate::logging::ProgressEventDispatcher;
use crate::steps::runner::BuildResult;
use crate::steps::{AsyncStep, BuildContext};
use std::path::PathBuf;
use std::sync::Arc;

/// Digests a registry would report for `image`, computed locally
fn local_build_result(context: &BuildContext, image: &Image) -> Result<BuildResult> {
    let blob = BytesBlob::json(&image.to_container_configuration())?;
    let configuration = BlobDescriptor::new(Digest::of_bytes(blob.bytes()), blob.bytes().len() as u64);
    let manifest = image.to_manifest(context.configuration().image_format(), &configuration);
    Ok(BuildResult {
        image_digest: manifest.digest()?,
        image_id: configuration.digest,
    })
}

fn tarball(context: &BuildContext, image: Image) -> ImageTarball {
    ImageTarball::new(
        image,
        context.target_image().clone(),
        context.configuration().all_target_tags(),
    )
}

pub fn load_docker(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    docker_client: Arc<dyn DockerClient>,
    image: &AsyncStep<Image>,
) -> AsyncStep<BuildResult> {
    let token = context.cancellation().clone();
    let context = context.clone();
    let dispatcher = progress.new_child("loading to Docker daemon", 1);
    image.then("load docker", &token, move |image| async move {
        let result = local_build_result(&context, &image)?;
        context
            .logger()
            .lifecycle(&format!("Loading to Docker daemon as {}...", context.target_image()));
        let output = docker_client.load(tarball(&context, image)).await?;
        context.logger().debug(&output);
        dispatcher.close();
        Ok(result)
    })
}

pub fn write_tar_file(
    context: &BuildContext,
    progress: &Arc<ProgressEventDispatcher>,
    output: PathBuf,
    image: &AsyncStep<Image>,
) -> AsyncStep<BuildResult> {
    let token = context.cancellation().clone();
    let context = context.clone();
    let dispatcher = progress.new_child("writing to tar file", 1);
    image.then("write tar file", &token, move |image| async move {
        let result = local_build_result(&context, &image)?;
        context
            .logger()
            .lifecycle(&format!("Building image to tar file {}...", output.display()));
        let archive = tarball(&context, image);
        tokio::task::spawn_blocking(move || archive.write_to_file(&output)).await??;
        dispatcher.close();
        Ok(result)
    })
}
