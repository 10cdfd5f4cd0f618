//! Error types for image building, registry operations and layer caching
//!
//! Every error is cheap to clone so that the memoized result of a build step can be
//! observed by any number of dependent steps.

pub mod handlers;

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuilderError>;

#[derive(Debug, Clone, Error)]
pub enum BuilderError {
    /// Malformed `sha256:` digest or bare hash
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),

    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("Invalid build configuration: {0}")]
    InvalidConfiguration(String),

    /// Plain HTTP or unverifiable TLS was required but insecure registries are not allowed
    #[error(
        "Failed to verify the server at {url} because only secure connections are allowed; \
         allow insecure registries to connect anyway"
    )]
    InsecureRegistry { url: String },

    #[error("Unauthorized for {registry}/{repository}: {message}")]
    Unauthorized {
        registry: String,
        repository: String,
        message: String,
    },

    /// The registry wanted credentials but they were withheld on a plain HTTP connection
    #[error(
        "Required credentials for {registry}/{repository} were not sent because the connection \
         was over HTTP"
    )]
    CredentialsNotSent { registry: String, repository: String },

    #[error("Failed to authenticate with registry {registry}/{repository}: {message}")]
    AuthenticationFailed {
        registry: String,
        repository: String,
        message: String,
    },

    /// A registry answered with a response that does not fit the operation
    #[error("Tried to {action} but failed because: {reason}")]
    Registry { action: String, reason: String },

    #[error("Unknown manifest format: {0}")]
    UnknownManifestFormat(String),

    #[error("The pulled BLOB has digest '{received}', but the request digest was '{expected}'")]
    UnexpectedBlobDigest { expected: String, received: String },

    #[error(
        "Broken pipe while trying to {action}: {message}; this may be caused by the registry \
         rejecting the upload or by an unstable network"
    )]
    BrokenPipe { action: String, message: String },

    #[error("No response from the registry while trying to {action}: {message}")]
    NoResponse { action: String, message: String },

    #[error("Connection failed while trying to {action}: {message}")]
    Transport { action: String, message: String },

    #[error("Too many redirects (more than {max}) while trying to {action}, last location {url}")]
    TooManyRedirects {
        action: String,
        url: String,
        max: usize,
    },

    #[error("Could not create cache directory {}: {message}", path.display())]
    CacheDirectoryCreation { path: PathBuf, message: String },

    #[error("Cache entry at {} is corrupted: {message}", path.display())]
    CacheCorrupted { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("Failed to load image into the local engine: {0}")]
    DockerLoad(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Build step panicked: {0}")]
    StepPanicked(String),

    /// A step was scheduled before a step it depends on
    #[error("Build step '{step}' requires '{requires}' to be scheduled first")]
    MissingStep {
        step: &'static str,
        requires: &'static str,
    },
}

impl BuilderError {
    pub fn registry(action: impl Into<String>, reason: impl Into<String>) -> Self {
        BuilderError::Registry {
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        BuilderError::CacheCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for the two unauthorized flavours a credential retry may recover from
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BuilderError::Unauthorized { .. })
    }
}

impl From<std::io::Error> for BuilderError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            BuilderError::BrokenPipe {
                action: "write".to_string(),
                message: err.to_string(),
            }
        } else {
            BuilderError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BuilderError {
    fn from(err: serde_json::Error) -> Self {
        BuilderError::Json(err.to_string())
    }
}

impl From<url::ParseError> for BuilderError {
    fn from(err: url::ParseError) -> Self {
        BuilderError::Url(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BuilderError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            BuilderError::Cancelled
        } else {
            BuilderError::StepPanicked(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_pipe_io_error_is_distinct() {
        let err: BuilderError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, BuilderError::BrokenPipe { .. }));

        let err: BuilderError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, BuilderError::Io(_)));
    }

    #[test]
    fn test_registry_error_message_names_action() {
        let err = BuilderError::registry("pull BLOB for r/i", "digest invalid");
        assert_eq!(
            err.to_string(),
            "Tried to pull BLOB for r/i but failed because: digest invalid"
        );
    }
}
