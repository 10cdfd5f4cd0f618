//! Registry credentials, authorizations and the credential retriever chain

use crate::error::{BuilderError, Result};
use crate::image::reference::DEFAULT_REGISTRY;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Username marking the password as an OAuth2 refresh token
pub const OAUTH2_TOKEN_USER: &str = "<token>";

const DOCKER_HUB_CONFIG_KEYS: &[&str] = &[
    "https://index.docker.io/v1/",
    "index.docker.io",
    "docker.io",
    "registry-1.docker.io",
];

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credential carrying an OAuth2 refresh token instead of a password
    pub fn refresh_token(token: impl Into<String>) -> Self {
        Self::new(OAUTH2_TOKEN_USER, token)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn is_oauth2_refresh_token(&self) -> bool {
        self.username == OAUTH2_TOKEN_USER
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Value of an `Authorization` header
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization {
    scheme: String,
    token: String,
}

impl Authorization {
    pub fn basic(username: &str, password: &str) -> Self {
        Self {
            scheme: "Basic".to_string(),
            token: STANDARD.encode(format!("{}:{}", username, password)),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: "Bearer".to_string(),
            token: token.into(),
        }
    }

    pub fn from_credential(credential: &Credential) -> Self {
        Self::basic(credential.username(), credential.password())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.token)
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Authorization({} <redacted>)", self.scheme)
    }
}

/// One source of credentials for a registry
pub trait CredentialRetriever: Send + Sync {
    /// `Ok(None)` lets the next retriever in the chain try
    fn retrieve(&self) -> Result<Option<Credential>>;
}

/// Run retrievers in order; the first credential wins and the first error aborts the chain
pub fn retrieve_credential(retrievers: &[std::sync::Arc<dyn CredentialRetriever>]) -> Result<Option<Credential>> {
    for retriever in retrievers {
        if let Some(credential) = retriever.retrieve()? {
            return Ok(Some(credential));
        }
    }
    Ok(None)
}

/// A credential given up front
#[derive(Debug, Clone)]
pub struct StaticCredentialRetriever(pub Credential);

impl CredentialRetriever for StaticCredentialRetriever {
    fn retrieve(&self) -> Result<Option<Credential>> {
        Ok(Some(self.0.clone()))
    }
}

/// Username and password read from two environment variables
#[derive(Debug, Clone)]
pub struct EnvironmentCredentialRetriever {
    username_variable: String,
    password_variable: String,
}

impl EnvironmentCredentialRetriever {
    pub fn new(username_variable: impl Into<String>, password_variable: impl Into<String>) -> Self {
        Self {
            username_variable: username_variable.into(),
            password_variable: password_variable.into(),
        }
    }
}

impl CredentialRetriever for EnvironmentCredentialRetriever {
    fn retrieve(&self) -> Result<Option<Credential>> {
        match (
            std::env::var(&self.username_variable),
            std::env::var(&self.password_variable),
        ) {
            (Ok(username), Ok(password)) if !username.is_empty() => {
                tracing::debug!("Using credentials from ${}", self.username_variable);
                Ok(Some(Credential::new(username, password)))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerConfigAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigAuth {
    auth: Option<String>,
    identitytoken: Option<String>,
}

/// Credentials stored by `docker login` in a Docker `config.json`
#[derive(Debug, Clone)]
pub struct DockerConfigCredentialRetriever {
    registry: String,
    config_path: PathBuf,
}

impl DockerConfigCredentialRetriever {
    /// Reads `$DOCKER_CONFIG/config.json`, falling back to `~/.docker/config.json`
    pub fn new(registry: impl Into<String>) -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|home| home.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");
        Self::with_config_path(registry, config_path)
    }

    pub fn with_config_path(registry: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            registry: registry.into(),
            config_path: config_path.into(),
        }
    }

    fn find_entry<'a>(&self, config: &'a DockerConfigFile) -> Option<&'a DockerConfigAuth> {
        if let Some(entry) = config.auths.get(&self.registry) {
            return Some(entry);
        }
        // Keys are often stored as URLs, e.g. "https://gcr.io"
        let by_host = config.auths.iter().find_map(|(key, entry)| {
            let host = key
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or_default();
            (host == self.registry).then_some(entry)
        });
        if by_host.is_some() || self.registry != DEFAULT_REGISTRY {
            return by_host;
        }
        DOCKER_HUB_CONFIG_KEYS.iter().find_map(|key| config.auths.get(*key))
    }

    fn decode(&self, entry: &DockerConfigAuth) -> Result<Option<Credential>> {
        let Some(auth) = entry.auth.as_deref().filter(|auth| !auth.is_empty()) else {
            return Ok(entry
                .identitytoken
                .as_ref()
                .map(|token| Credential::refresh_token(token.clone())));
        };
        let decoded = STANDARD.decode(auth).map_err(|e| self.invalid(&format!("auth is not base64: {}", e)))?;
        let decoded = String::from_utf8(decoded).map_err(|_| self.invalid("auth is not UTF-8"))?;
        let Some((username, password)) = decoded.split_once(':') else {
            return Err(self.invalid("auth is not of the form user:password"));
        };

        // docker login with an identity token stores "<token>:" next to the token itself
        match &entry.identitytoken {
            Some(token) if !token.is_empty() => Ok(Some(Credential::refresh_token(token.clone()))),
            _ => Ok(Some(Credential::new(username, password))),
        }
    }

    fn invalid(&self, message: &str) -> BuilderError {
        BuilderError::InvalidConfiguration(format!(
            "credentials for {} in {}: {}",
            self.registry,
            self.config_path.display(),
            message
        ))
    }
}

impl CredentialRetriever for DockerConfigCredentialRetriever {
    fn retrieve(&self) -> Result<Option<Credential>> {
        if !self.config_path.exists() {
            tracing::debug!("Docker config not found at {}", self.config_path.display());
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.config_path)?;
        let config: DockerConfigFile = serde_json::from_str(&content)?;
        match self.find_entry(&config) {
            Some(entry) => {
                tracing::debug!("Found credentials for {} in Docker config", self.registry);
                self.decode(entry)
            }
            None => Ok(None),
        }
    }
}
