//! Everything a step needs that is shared across one build

use crate::cache::Cache;
use crate::config::BuildConfiguration;
use crate::error::Result;
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::logging::progress::{ProgressEventDispatcher, ThrottledProgressListener};
use crate::registry::client::RegistryClient;
use crate::registry::credential::Authorization;
use crate::registry::operations::ByteCountListener;
use crate::registry::transport::HttpTransport;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct BuildContext {
    configuration: Arc<BuildConfiguration>,
    transport: Arc<dyn HttpTransport>,
    base_image_layers_cache: Cache,
    application_layers_cache: Cache,
    cancellation: CancellationToken,
}

impl BuildContext {
    /// Open both caches; fails if either directory cannot be created
    pub fn new(configuration: BuildConfiguration, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let base_image_layers_cache = Cache::with_directory(configuration.base_image_layers_cache_directory())?;
        let application_layers_cache = Cache::with_directory(configuration.application_layers_cache_directory())?;
        Ok(Self {
            configuration: Arc::new(configuration),
            transport,
            base_image_layers_cache,
            application_layers_cache,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn configuration(&self) -> &BuildConfiguration {
        &self.configuration
    }

    pub fn logger(&self) -> &Logger {
        self.configuration.logger()
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        self.transport.clone()
    }

    pub fn base_image_layers_cache(&self) -> &Cache {
        &self.base_image_layers_cache
    }

    pub fn application_layers_cache(&self) -> &Cache {
        &self.application_layers_cache
    }

    /// Cancelling this token aborts every step of the build
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Same context under a child token, so one run can be torn down on its own
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }

    pub fn base_image(&self) -> &ImageReference {
        self.configuration.base_image().image()
    }

    pub fn target_image(&self) -> &ImageReference {
        self.configuration.target_image().image()
    }

    /// Registry client for `image` carrying `authorization`
    pub fn registry_client(&self, image: &ImageReference, authorization: Option<Authorization>) -> RegistryClient {
        let client = RegistryClient::for_image(&self.configuration, self.transport.clone(), image);
        client.set_authorization(authorization);
        client
    }
}

/// Throttled byte counter feeding a progress dispatcher
pub fn byte_progress(dispatcher: Arc<ProgressEventDispatcher>) -> (ByteCountListener, Arc<ThrottledProgressListener>) {
    let throttled = Arc::new(ThrottledProgressListener::new(move |units| {
        dispatcher.dispatch_progress(units)
    }));
    let listener = throttled.clone();
    (Arc::new(move |units| listener.accept(units)), throttled)
}

/// A child allocation created on first use, once its size is known
struct DeferredChild {
    parent: Arc<ProgressEventDispatcher>,
    description: String,
    child: OnceLock<ProgressEventDispatcher>,
}

impl DeferredChild {
    fn sized(&self, allocation_units: u64) -> &ProgressEventDispatcher {
        self.child
            .get_or_init(|| self.parent.new_child(self.description.clone(), allocation_units))
    }
}

/// Size and write listeners for a blob pull
///
/// The child allocation takes its size from the length the registry reports before
/// streaming, or from `expected_size` when no length is reported.
pub fn blob_pull_progress(
    parent: Arc<ProgressEventDispatcher>,
    description: impl Into<String>,
    expected_size: Option<u64>,
) -> (ByteCountListener, ByteCountListener, Arc<ThrottledProgressListener>) {
    let deferred = Arc::new(DeferredChild {
        parent,
        description: description.into(),
        child: OnceLock::new(),
    });
    let sizing = deferred.clone();
    let size_listener: ByteCountListener = Arc::new(move |size| {
        sizing.sized(size);
    });

    let fallback = expected_size.unwrap_or(0);
    let throttled = Arc::new(ThrottledProgressListener::new(move |units| {
        deferred.sized(fallback).dispatch_progress(units)
    }));
    let listener = throttled.clone();
    (size_listener, Arc::new(move |units| listener.accept(units)), throttled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::EventHandlers;
    use std::sync::Mutex;

    fn recording_logger() -> (Logger, Arc<Mutex<Vec<(String, u64, u64)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let logger = Logger::new(EventHandlers::new().add_progress_handler(move |event| {
            sink.lock().unwrap().push((
                event.allocation.description().to_string(),
                event.allocation.allocation_units(),
                event.units,
            ));
        }));
        (logger, events)
    }

    fn layer_events(events: &Mutex<Vec<(String, u64, u64)>>) -> Vec<(u64, u64)> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|(description, _, _)| description == "pulling layer")
            .map(|(_, allocation_units, units)| (*allocation_units, *units))
            .collect()
    }

    #[test]
    fn test_reported_length_sizes_the_layer_allocation() {
        let (logger, events) = recording_logger();
        let root = Arc::new(ProgressEventDispatcher::new_root(&logger, "layers", 1));
        {
            let (size_listener, write_listener, throttled) =
                blob_pull_progress(root.clone(), "pulling layer", None);
            size_listener(100);
            write_listener(40);
            write_listener(60);
            throttled.flush();
        }

        let layer = layer_events(&events);
        assert!(layer.iter().all(|(allocation_units, _)| *allocation_units == 100));
        assert_eq!(layer.iter().map(|(_, units)| units).sum::<u64>(), 100);
    }

    #[test]
    fn test_expected_size_is_used_without_reported_length() {
        let (logger, events) = recording_logger();
        let root = Arc::new(ProgressEventDispatcher::new_root(&logger, "layers", 1));
        {
            let (_size_listener, write_listener, throttled) =
                blob_pull_progress(root.clone(), "pulling layer", Some(30));
            write_listener(30);
            throttled.flush();
        }

        let layer = layer_events(&events);
        assert!(!layer.is_empty());
        assert!(layer.iter().all(|(allocation_units, _)| *allocation_units == 30));
        assert_eq!(layer.iter().map(|(_, units)| units).sum::<u64>(), 30);
    }
}
