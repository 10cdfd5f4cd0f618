//! Endpoint caller: runs one registry operation against a URL
//!
//! The caller owns the connection policy. A URL that is not HTTPS is refused unless insecure
//! registries are allowed. A certificate failure is retried without verification, and
//! then over plain HTTP, but only when insecure registries are allowed. A refused connection
//! on the default HTTPS port falls back to HTTP under the same flag. Redirects are followed
//! up to a fixed count, re-applying every check to the new location. Responses the operation
//! does not handle itself are translated into typed errors here.

use crate::error::handlers::RegistryErrorHandler;
use crate::error::{BuilderError, Result};
use crate::logging::Logger;
use crate::registry::credential::Authorization;
use crate::registry::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody, TlsMode, TransportError};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use url::Url;

/// Registry and image every operation of one client is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpointRequestProperties {
    pub server_url: String,
    pub image_name: String,
}

impl RegistryEndpointRequestProperties {
    pub fn new(server_url: impl Into<String>, image_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            image_name: image_name.into(),
        }
    }
}

/// Error response with its body already read
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Url,
    pub body: String,
}

impl ErrorResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// One registry operation: what to send and how to read the answer
#[async_trait]
pub trait RegistryEndpointProvider: Send + Sync {
    type Output: Send;

    fn http_method(&self) -> Method;

    /// Absolute URL of the operation given the `https://<registry>/v2/` root
    fn api_route(&self, api_route_base: &Url) -> Result<Url>;

    fn content(&self) -> Option<RequestBody> {
        None
    }

    fn content_type(&self) -> Option<String> {
        None
    }

    fn accepted_media_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Used in error messages, e.g. "pull image manifest for gcr.io/p/app:1"
    fn action_description(&self) -> String;

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output>;

    /// First chance at a non-2xx response; `Ok(None)` leaves it to the caller
    async fn handle_http_error(&self, _response: &ErrorResponse) -> Result<Option<Self::Output>> {
        Ok(None)
    }
}

/// Connection policy shared by every call of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerSettings {
    pub allow_insecure_registries: bool,
    pub send_credentials_over_http: bool,
    pub max_redirects: usize,
}

impl Default for CallerSettings {
    fn default() -> Self {
        Self {
            allow_insecure_registries: false,
            send_credentials_over_http: false,
            max_redirects: crate::config::DEFAULT_MAX_REDIRECTS,
        }
    }
}

enum Outcome<T> {
    Done(T),
    Redirect(Url),
}

pub struct RegistryEndpointCaller<'a, P: RegistryEndpointProvider> {
    transport: Arc<dyn HttpTransport>,
    settings: CallerSettings,
    logger: &'a Logger,
    properties: &'a RegistryEndpointRequestProperties,
    authorization: Option<Authorization>,
    provider: &'a P,
}

impl<'a, P: RegistryEndpointProvider> RegistryEndpointCaller<'a, P> {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        settings: CallerSettings,
        logger: &'a Logger,
        properties: &'a RegistryEndpointRequestProperties,
        authorization: Option<Authorization>,
        provider: &'a P,
    ) -> Self {
        Self {
            transport,
            settings,
            logger,
            properties,
            authorization,
            provider,
        }
    }

    pub fn api_route_base(&self) -> Result<Url> {
        Ok(Url::parse(&format!("https://{}/v2/", self.properties.server_url))?)
    }

    pub async fn call(&self) -> Result<P::Output> {
        let base = self.api_route_base()?;
        let original_host = base.host_str().map(str::to_string);
        let mut url = self.provider.api_route(&base)?;
        let mut redirects = 0;
        loop {
            let same_host = url.host_str().map(str::to_string) == original_host;
            match self.call_url(&url, same_host).await? {
                Outcome::Done(output) => return Ok(output),
                Outcome::Redirect(location) => {
                    redirects += 1;
                    if redirects > self.settings.max_redirects {
                        return Err(BuilderError::TooManyRedirects {
                            action: self.provider.action_description(),
                            url: location.to_string(),
                            max: self.settings.max_redirects,
                        });
                    }
                    self.logger.debug(&format!("Following redirect from {} to {}", url, location));
                    url = location;
                }
            }
        }
    }

    async fn call_url(&self, url: &Url, same_host: bool) -> Result<Outcome<P::Output>> {
        let is_https = url.scheme() == "https";
        if !is_https && !self.settings.allow_insecure_registries {
            return Err(BuilderError::InsecureRegistry { url: url.to_string() });
        }

        let result = match self.send(url, TlsMode::Verified, same_host).await {
            Err(TransportError::Tls(message)) if is_https => {
                if !self.settings.allow_insecure_registries {
                    self.logger.debug(&format!("TLS verification failed for {}: {}", url, message));
                    return Err(BuilderError::InsecureRegistry { url: url.to_string() });
                }
                self.logger.info(&format!(
                    "Cannot verify server at {}. Attempting again with no TLS verification.",
                    url
                ));
                match self.send(url, TlsMode::Insecure, same_host).await {
                    Err(TransportError::Tls(_)) => {
                        self.logger.info(&format!(
                            "Failed to connect to {} over HTTPS. Attempting again with HTTP.",
                            url
                        ));
                        self.send(&plain_http(url)?, TlsMode::Verified, same_host).await
                    }
                    other => other,
                }
            }
            Err(TransportError::ConnectionRefused(_))
                if is_https && self.settings.allow_insecure_registries && url.port().is_none() =>
            {
                self.logger.info(&format!(
                    "Failed to connect to {} over HTTPS. Attempting again with HTTP.",
                    url
                ));
                self.send(&plain_http(url)?, TlsMode::Verified, same_host).await
            }
            other => other,
        };

        let response = result.map_err(|e| e.into_builder_error(&self.provider.action_description()))?;
        self.handle(response).await
    }

    fn attaches_credentials(&self, url: &Url, same_host: bool) -> bool {
        same_host && (url.scheme() == "https" || self.settings.send_credentials_over_http)
    }

    async fn send(&self, url: &Url, tls: TlsMode, same_host: bool) -> std::result::Result<HttpResponse, TransportError> {
        let mut headers = HeaderMap::new();
        let accepted = self.provider.accepted_media_types();
        if !accepted.is_empty() {
            insert_header(&mut headers, ACCEPT, &accepted.join(", "))?;
        }
        if let Some(content_type) = self.provider.content_type() {
            insert_header(&mut headers, CONTENT_TYPE, &content_type)?;
        }
        if let Some(authorization) = &self.authorization {
            if self.attaches_credentials(url, same_host) {
                insert_header(&mut headers, AUTHORIZATION, &authorization.header_value())?;
            }
        }

        let request = HttpRequest {
            method: self.provider.http_method(),
            url: url.clone(),
            headers,
            body: self.provider.content(),
        };
        self.transport.send(request, tls).await
    }

    async fn handle(&self, response: HttpResponse) -> Result<Outcome<P::Output>> {
        let status = response.status();
        if status.is_success() {
            return self.provider.handle_response(response).await.map(Outcome::Done);
        }

        if matches!(
            status,
            StatusCode::MOVED_PERMANENTLY | StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
        ) {
            let Some(location) = response.header(LOCATION.as_str()) else {
                return Err(BuilderError::registry(
                    self.provider.action_description(),
                    format!("registry returned redirect {} without a Location header", status.as_u16()),
                ));
            };
            return Ok(Outcome::Redirect(response.url().join(location)?));
        }

        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| e.into_builder_error(&self.provider.action_description()))?;
        let error = ErrorResponse {
            status,
            headers,
            url,
            body,
        };
        if let Some(output) = self.provider.handle_http_error(&error).await? {
            return Ok(Outcome::Done(output));
        }
        Err(self.error_for(&error))
    }

    fn error_for(&self, error: &ErrorResponse) -> BuilderError {
        let action = self.provider.action_description();
        match error.status {
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
                RegistryErrorHandler::registry_error(&action, error.status, &error.body)
            }
            StatusCode::FORBIDDEN => BuilderError::Unauthorized {
                registry: self.properties.server_url.clone(),
                repository: self.properties.image_name.clone(),
                message: format!("access denied: {}", error.body),
            },
            StatusCode::UNAUTHORIZED => {
                if error.url.scheme() == "https" || self.settings.send_credentials_over_http {
                    BuilderError::Unauthorized {
                        registry: self.properties.server_url.clone(),
                        repository: self.properties.image_name.clone(),
                        message: format!("wrong or missing credentials: {}", error.body),
                    }
                } else {
                    BuilderError::CredentialsNotSent {
                        registry: self.properties.server_url.clone(),
                        repository: self.properties.image_name.clone(),
                    }
                }
            }
            status => BuilderError::registry(
                action,
                format!("registry returned error code {}: {}", status.as_u16(), error.body),
            ),
        }
    }
}

fn plain_http(url: &Url) -> Result<Url> {
    let mut http = url.clone();
    http.set_scheme("http")
        .map_err(|_| BuilderError::Url(format!("cannot switch {} to http", url)))?;
    Ok(http)
}

fn insert_header(
    headers: &mut HeaderMap,
    name: reqwest::header::HeaderName,
    value: &str,
) -> std::result::Result<(), TransportError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| TransportError::Other(format!("invalid value for header {}", name)))?;
    headers.insert(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_http_keeps_host_port_and_path() {
        let url = Url::parse("https://registry.example:5000/v2/a/manifests/1?x=y").unwrap();
        assert_eq!(
            plain_http(&url).unwrap().as_str(),
            "http://registry.example:5000/v2/a/manifests/1?x=y"
        );
    }
}
