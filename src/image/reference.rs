//! Image reference parsing
//!
//! Parses references like `gcr.io/project/app:v1`, `nginx` or
//! `localhost:5000/app@sha256:...` into registry, repository, tag and digest.

use crate::error::{BuilderError, Result};
use crate::image::digest::Digest;
use std::fmt;
use std::str::FromStr;

/// Registry used when a reference names none
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Tag used when a reference names neither tag nor digest
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry.hub.docker.com"];
const LIBRARY_PREFIX: &str = "library/";
const SCRATCH: &str = "scratch";
const MAX_TAG_LENGTH: usize = 128;

/// Parsed and validated image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a reference string
    ///
    /// - `nginx` → `registry-1.docker.io/library/nginx:latest`
    /// - `user/app:1.0` → `registry-1.docker.io/user/app:1.0`
    /// - `localhost:5000/app` → `localhost:5000/app:latest`
    /// - `gcr.io/p/app@sha256:...` → pinned by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "reference is empty"));
        }
        if reference == SCRATCH {
            return Ok(Self::scratch());
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => (
                name_tag,
                Some(Digest::from_digest(digest).map_err(|_| invalid(reference, "digest is malformed"))?),
            ),
            None => (reference, None),
        };

        let last_slash = name_tag.rfind('/').map_or(0, |pos| pos + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => (
                &name_tag[..last_slash + colon],
                Some(&name_tag[last_slash + colon + 1..]),
            ),
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry(name);
        if !is_valid_registry(&registry) {
            return Err(invalid(reference, "registry is not a valid host[:port]"));
        }
        if !is_valid_repository(&repository) {
            return Err(invalid(reference, "repository must be lowercase path components"));
        }
        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(invalid(reference, "tag is malformed"));
            }
        }

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Build a reference from parts, validating each
    pub fn of(registry: Option<&str>, repository: &str, qualifier: Option<&str>) -> Result<Self> {
        let mut reference = match registry {
            Some(registry) => format!("{}/{}", registry, repository),
            None => repository.to_string(),
        };
        if let Some(qualifier) = qualifier {
            reference.push(if qualifier.starts_with("sha256:") { '@' } else { ':' });
            reference.push_str(qualifier);
        }
        Self::parse(&reference)
    }

    /// The empty base image
    pub fn scratch() -> Self {
        Self {
            registry: String::new(),
            repository: SCRATCH.to_string(),
            tag: None,
            digest: None,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.registry.is_empty() && self.repository == SCRATCH
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn is_default_registry(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// What goes after `/manifests/`: the digest when pinned, otherwise the tag
    pub fn qualifier(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Same image under another tag; any digest pin is dropped
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !is_valid_tag(tag) {
            return Err(invalid(tag, "tag is malformed"));
        }
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }
}

fn invalid(reference: &str, reason: &str) -> BuilderError {
    BuilderError::InvalidImageReference(format!("'{}': {}", reference, reason))
}

fn split_registry(name: &str) -> (String, String) {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.bytes().any(|b| b.is_ascii_uppercase()) =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    let registry = if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry
    };
    let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("{}{}", LIBRARY_PREFIX, repository)
    } else {
        repository
    };
    (registry, repository)
}

fn is_valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

fn is_valid_repository(repository: &str) -> bool {
    !repository.is_empty() && repository.split('/').all(is_valid_component)
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__` or any number of `-`
fn is_valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) if alnum(first) && alnum(last) => {}
        _ => return false,
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        if !(separator == "." || separator == "_" || separator == "__" || separator.bytes().all(|b| b == b'-')) {
            return false;
        }
    }
    true
}

/// `[\w][\w.-]{0,127}`
fn is_valid_tag(tag: &str) -> bool {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    match tag.as_bytes().split_first() {
        Some((&first, rest)) => {
            tag.len() <= MAX_TAG_LENGTH && word(first) && rest.iter().all(|&b| word(b) || b == b'.' || b == b'-')
        }
        None => false,
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scratch() {
            return f.write_str(SCRATCH);
        }
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
