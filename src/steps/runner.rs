//! Wires the build steps for one target and runs them
//!
//! Step constructors are recorded in call order and only executed by [`StepsRunner::run`],
//! which builds the step graph and awaits the terminal step. The first failure anywhere in
//! the graph is returned as is, and every other step of the run is cancelled.

use crate::cache::CachedLayer;
use crate::error::{BuilderError, Result};
use crate::image::digest::{BlobDescriptor, Digest};
use crate::image::model::Image;
use crate::image::tarball::DockerClient;
use crate::logging::ProgressEventDispatcher;
use crate::registry::credential::{Authorization, Credential};
use crate::steps::pull::BaseImage;
use crate::steps::{AsyncStep, BuildContext, build, local, pull, push};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Digest of the image manifest
    pub image_digest: Digest,
    /// Digest of the container configuration, the id a local engine shows
    pub image_id: Digest,
}

/// Steps created so far in one run
struct StepResults {
    context: BuildContext,
    progress: Arc<ProgressEventDispatcher>,
    target_registry_credentials: Option<AsyncStep<Option<Credential>>>,
    push_authorization: Option<AsyncStep<Option<Authorization>>>,
    base_image: Option<AsyncStep<BaseImage>>,
    base_image_layers: Option<AsyncStep<Vec<CachedLayer>>>,
    base_image_layer_pushes: Option<AsyncStep<Vec<BlobDescriptor>>>,
    application_layers: Option<AsyncStep<Vec<CachedLayer>>>,
    application_layer_pushes: Option<AsyncStep<Vec<BlobDescriptor>>>,
    image: Option<AsyncStep<Image>>,
    container_configuration_push: Option<AsyncStep<BlobDescriptor>>,
    build_result: Option<AsyncStep<BuildResult>>,
}

fn required<T: Clone + Send + Sync + 'static>(
    step: &Option<AsyncStep<T>>,
    name: &'static str,
    requires: &'static str,
) -> Result<AsyncStep<T>> {
    step.clone().ok_or(BuilderError::MissingStep { step: name, requires })
}

type StepConstructor = Box<dyn FnOnce(&mut StepResults) -> Result<()> + Send>;

pub struct StepsRunner {
    context: BuildContext,
    steps: Vec<(&'static str, StepConstructor)>,
}

impl StepsRunner {
    pub fn new(context: BuildContext) -> Self {
        Self {
            context,
            steps: Vec::new(),
        }
    }

    /// Pull the base image, build the application layers and push everything to the target
    pub fn for_build_to_registry(context: BuildContext) -> Self {
        Self::new(context)
            .retrieve_target_registry_credentials()
            .authenticate_push()
            .pull_base_image()
            .pull_and_cache_base_image_layers()
            .push_base_image_layers()
            .build_and_cache_application_layers()
            .build_image()
            .push_container_configuration()
            .push_application_layers()
            .push_image()
    }

    /// Build the image and load it into a local engine
    pub fn for_build_to_docker_daemon(context: BuildContext, docker_client: Arc<dyn DockerClient>) -> Self {
        Self::new(context)
            .pull_base_image()
            .pull_and_cache_base_image_layers()
            .build_and_cache_application_layers()
            .build_image()
            .load_docker(docker_client)
    }

    /// Build the image into a `docker load` tarball at `output`
    pub fn for_build_tar(context: BuildContext, output: impl Into<PathBuf>) -> Self {
        Self::new(context)
            .pull_base_image()
            .pull_and_cache_base_image_layers()
            .build_and_cache_application_layers()
            .build_image()
            .write_tar_file(output)
    }

    /// Cancelling this token aborts the build
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancellation().clone()
    }

    fn enqueue<F>(mut self, name: &'static str, constructor: F) -> Self
    where
        F: FnOnce(&mut StepResults) -> Result<()> + Send + 'static,
    {
        self.steps.push((name, Box::new(constructor)));
        self
    }

    pub fn retrieve_target_registry_credentials(self) -> Self {
        self.enqueue("retrieve target registry credentials", |results| {
            results.target_registry_credentials = Some(push::retrieve_target_registry_credentials(
                &results.context,
                &results.progress,
            ));
            Ok(())
        })
    }

    pub fn authenticate_push(self) -> Self {
        self.enqueue("authenticate push", |results| {
            let credentials = required(
                &results.target_registry_credentials,
                "authenticate push",
                "retrieve target registry credentials",
            )?;
            results.push_authorization = Some(push::authenticate_push(&results.context, &results.progress, &credentials));
            Ok(())
        })
    }

    pub fn pull_base_image(self) -> Self {
        self.enqueue("pull base image", |results| {
            results.base_image = Some(pull::pull_base_image(&results.context, &results.progress));
            Ok(())
        })
    }

    pub fn pull_and_cache_base_image_layers(self) -> Self {
        self.enqueue("pull and cache base image layers", |results| {
            let base_image = required(&results.base_image, "pull and cache base image layers", "pull base image")?;
            results.base_image_layers = Some(pull::pull_and_cache_base_image_layers(
                &results.context,
                &results.progress,
                &base_image,
            ));
            Ok(())
        })
    }

    pub fn push_base_image_layers(self) -> Self {
        self.enqueue("push base image layers", |results| {
            let authorization = required(&results.push_authorization, "push base image layers", "authenticate push")?;
            let base_image = required(&results.base_image, "push base image layers", "pull base image")?;
            let layers = required(
                &results.base_image_layers,
                "push base image layers",
                "pull and cache base image layers",
            )?;
            results.base_image_layer_pushes = Some(push::push_base_image_layers(
                &results.context,
                &results.progress,
                &authorization,
                &base_image,
                &layers,
            ));
            Ok(())
        })
    }

    pub fn build_and_cache_application_layers(self) -> Self {
        self.enqueue("build and cache application layers", |results| {
            results.application_layers = Some(build::build_and_cache_application_layers(
                &results.context,
                &results.progress,
            ));
            Ok(())
        })
    }

    pub fn build_image(self) -> Self {
        self.enqueue("build image", |results| {
            let base_image = required(&results.base_image, "build image", "pull base image")?;
            let base_image_layers = required(
                &results.base_image_layers,
                "build image",
                "pull and cache base image layers",
            )?;
            let application_layers = required(
                &results.application_layers,
                "build image",
                "build and cache application layers",
            )?;
            results.image = Some(build::build_image(
                &results.context,
                &results.progress,
                &base_image,
                &base_image_layers,
                &application_layers,
            ));
            Ok(())
        })
    }

    pub fn push_container_configuration(self) -> Self {
        self.enqueue("push container configuration", |results| {
            let authorization = required(
                &results.push_authorization,
                "push container configuration",
                "authenticate push",
            )?;
            let image = required(&results.image, "push container configuration", "build image")?;
            results.container_configuration_push = Some(push::push_container_configuration(
                &results.context,
                &results.progress,
                &authorization,
                &image,
            ));
            Ok(())
        })
    }

    pub fn push_application_layers(self) -> Self {
        self.enqueue("push application layers", |results| {
            let authorization = required(&results.push_authorization, "push application layers", "authenticate push")?;
            let layers = required(
                &results.application_layers,
                "push application layers",
                "build and cache application layers",
            )?;
            results.application_layer_pushes = Some(push::push_application_layers(
                &results.context,
                &results.progress,
                &authorization,
                &layers,
            ));
            Ok(())
        })
    }

    pub fn push_image(self) -> Self {
        self.enqueue("push image", |results| {
            let authorization = required(&results.push_authorization, "push image", "authenticate push")?;
            let base_image_layer_pushes = required(&results.base_image_layer_pushes, "push image", "push base image layers")?;
            let application_layer_pushes = required(
                &results.application_layer_pushes,
                "push image",
                "push application layers",
            )?;
            let container_configuration_push = required(
                &results.container_configuration_push,
                "push image",
                "push container configuration",
            )?;
            let image = required(&results.image, "push image", "build image")?;
            results.build_result = Some(push::push_image(
                &results.context,
                &results.progress,
                &authorization,
                &base_image_layer_pushes,
                &application_layer_pushes,
                &container_configuration_push,
                &image,
            ));
            Ok(())
        })
    }

    pub fn load_docker(self, docker_client: Arc<dyn DockerClient>) -> Self {
        self.enqueue("load docker", move |results| {
            let image = required(&results.image, "load docker", "build image")?;
            results.build_result = Some(local::load_docker(
                &results.context,
                &results.progress,
                docker_client,
                &image,
            ));
            Ok(())
        })
    }

    pub fn write_tar_file(self, output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        self.enqueue("write tar file", move |results| {
            let image = required(&results.image, "write tar file", "build image")?;
            results.build_result = Some(local::write_tar_file(
                &results.context,
                &results.progress,
                output,
                &image,
            ));
            Ok(())
        })
    }

    /// Create every recorded step in order, then wait for the terminal one
    pub async fn run(self) -> Result<BuildResult> {
        let context = self.context.child();
        let _teardown = context.cancellation().clone().drop_guard();
        let logger = context.logger().clone();

        let progress = Arc::new(ProgressEventDispatcher::new_root(
            &logger,
            "building image",
            self.steps.len() as u64,
        ));
        let mut results = StepResults {
            context,
            progress: progress.clone(),
            target_registry_credentials: None,
            push_authorization: None,
            base_image: None,
            base_image_layers: None,
            base_image_layer_pushes: None,
            application_layers: None,
            application_layer_pushes: None,
            image: None,
            container_configuration_push: None,
            build_result: None,
        };
        for (name, constructor) in self.steps {
            logger.debug(&format!("Scheduling step: {}", name));
            constructor(&mut results)?;
        }

        let Some(terminal) = results.build_result.take() else {
            return Err(BuilderError::MissingStep {
                step: "run",
                requires: "push image, load docker or write tar file",
            });
        };
        let result = terminal.get().await;
        progress.close();
        result
    }
}
