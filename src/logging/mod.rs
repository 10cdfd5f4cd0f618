//! Build events and logging
//!
//! This module provides the [`Logger`] every component reports through. The logger never
//! writes to a console itself: each message becomes a [`LogEvent`] that is handed, in
//! registration order, to the subscribers of an [`EventHandlers`] list, and is mirrored to
//! `tracing` so embedding applications can route it to their own subscriber.

pub mod progress;

use std::fmt;
use std::sync::Arc;

pub use progress::{Allocation, ProgressEvent, ProgressEventDispatcher, ThrottledProgressListener};

/// Severity of a log event, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    /// Build milestones an operator always wants to see
    Lifecycle,
    /// Textual progress, distinct from structured [`ProgressEvent`]s
    Progress,
    Info,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Everything a build reports
#[derive(Debug, Clone)]
pub enum BuilderEvent {
    Log(LogEvent),
    Progress(ProgressEvent),
}

type Handler = Arc<dyn Fn(&BuilderEvent) + Send + Sync>;

/// Subscriber list owned by the build configuration
///
/// Handlers are registered before the build starts and invoked synchronously, in order,
/// for every event.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Vec<Handler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event
    pub fn add<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BuilderEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn add_log_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        self.add(move |event| {
            if let BuilderEvent::Log(log) = event {
                handler(log);
            }
        })
    }

    pub fn add_progress_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.add(move |event| {
            if let BuilderEvent::Progress(progress) = event {
                handler(progress);
            }
        })
    }

    pub fn dispatch(&self, event: &BuilderEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logger responsible for all user-visible output
#[derive(Debug, Clone, Default)]
pub struct Logger {
    handlers: EventHandlers,
}

impl Logger {
    pub fn new(handlers: EventHandlers) -> Self {
        Self { handlers }
    }

    /// A logger whose events only reach `tracing`
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{}", message);
        self.log(LogLevel::Error, message);
    }

    pub fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
        self.log(LogLevel::Warn, message);
    }

    pub fn lifecycle(&self, message: &str) {
        tracing::info!(lifecycle = true, "{}", message);
        self.log(LogLevel::Lifecycle, message);
    }

    pub fn progress(&self, message: &str) {
        tracing::debug!(progress = true, "{}", message);
        self.log(LogLevel::Progress, message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{}", message);
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!("{}", message);
        self.log(LogLevel::Debug, message);
    }

    pub fn dispatch(&self, event: BuilderEvent) {
        self.handlers.dispatch(&event);
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.handlers.dispatch(&BuilderEvent::Log(LogEvent {
            level,
            message: message.to_string(),
        }));
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_receive_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        let second = seen.clone();
        let handlers = EventHandlers::new()
            .add_log_handler(move |event| first.lock().unwrap().push(format!("a:{}", event.message)))
            .add_log_handler(move |event| second.lock().unwrap().push(format!("b:{}", event.message)));

        let logger = Logger::new(handlers);
        logger.lifecycle("one");
        logger.warning("two");

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:one", "b:one", "a:two", "b:two"]
        );
    }

    #[test]
    fn test_log_levels_are_preserved() {
        let levels = Arc::new(Mutex::new(Vec::new()));
        let sink = levels.clone();
        let logger = Logger::new(
            EventHandlers::new().add_log_handler(move |event| sink.lock().unwrap().push(event.level)),
        );
        logger.error("e");
        logger.debug("d");
        logger.progress("p");
        assert_eq!(
            *levels.lock().unwrap(),
            vec![LogLevel::Error, LogLevel::Debug, LogLevel::Progress]
        );
    }

    #[test]
    fn test_format_size() {
        let logger = Logger::silent();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(2048), "2.0 KB");
        assert_eq!(logger.format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
