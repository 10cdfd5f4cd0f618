//! Manifest pull and push

use crate::error::handlers::{RegistryErrorCode, RegistryErrorHandler};
use crate::error::{BuilderError, Result};
use crate::image::digest::Digest;
use crate::image::manifest::{ACCEPTED_MANIFEST_MEDIA_TYPES, ManifestTemplate};
use crate::logging::Logger;
use crate::registry::caller::{ErrorResponse, RegistryEndpointProvider, RegistryEndpointRequestProperties};
use crate::registry::transport::{HttpResponse, RequestBody};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use url::Url;

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// A pulled manifest and the digest of the bytes it was parsed from
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestAndDigest {
    pub manifest: ManifestTemplate,
    pub digest: Digest,
}

pub struct ManifestPuller<'a> {
    properties: &'a RegistryEndpointRequestProperties,
    qualifier: &'a str,
}

impl<'a> ManifestPuller<'a> {
    /// `qualifier` is a tag or a digest
    pub fn new(properties: &'a RegistryEndpointRequestProperties, qualifier: &'a str) -> Self {
        Self { properties, qualifier }
    }
}

#[async_trait]
impl RegistryEndpointProvider for ManifestPuller<'_> {
    type Output = ManifestAndDigest;

    fn http_method(&self) -> Method {
        Method::GET
    }

    fn api_route(&self, api_route_base: &Url) -> Result<Url> {
        Ok(api_route_base.join(&format!("{}/manifests/{}", self.properties.image_name, self.qualifier))?)
    }

    fn accepted_media_types(&self) -> Vec<String> {
        ACCEPTED_MANIFEST_MEDIA_TYPES.iter().map(|media_type| media_type.to_string()).collect()
    }

    fn action_description(&self) -> String {
        format!(
            "pull image manifest for {}/{}:{}",
            self.properties.server_url, self.properties.image_name, self.qualifier
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output> {
        let content_type = response.header(CONTENT_TYPE.as_str()).map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| e.into_builder_error(&self.action_description()))?;
        let manifest = ManifestTemplate::from_json(&body, content_type.as_deref())?;
        Ok(ManifestAndDigest {
            manifest,
            digest: Digest::of_bytes(&body),
        })
    }
}

/// Pushes a manifest under one tag; the locally computed digest is returned
pub struct ManifestPusher<'a> {
    properties: &'a RegistryEndpointRequestProperties,
    media_type: String,
    body: Bytes,
    tag: &'a str,
    logger: &'a Logger,
}

impl<'a> ManifestPusher<'a> {
    pub fn new(
        properties: &'a RegistryEndpointRequestProperties,
        manifest: &ManifestTemplate,
        tag: &'a str,
        logger: &'a Logger,
    ) -> Result<Self> {
        Ok(Self {
            properties,
            media_type: manifest.media_type().to_string(),
            body: Bytes::from(manifest.to_json()?),
            tag,
            logger,
        })
    }

    fn unsupported_format(&self) -> BuilderError {
        BuilderError::registry(
            self.action_description(),
            "Registry may not support pushing OCI Manifest or Docker Image Manifest Version 2, Schema 2",
        )
    }
}

#[async_trait]
impl RegistryEndpointProvider for ManifestPusher<'_> {
    type Output = Digest;

    fn http_method(&self) -> Method {
        Method::PUT
    }

    fn api_route(&self, api_route_base: &Url) -> Result<Url> {
        Ok(api_route_base.join(&format!("{}/manifests/{}", self.properties.image_name, self.tag))?)
    }

    fn content(&self) -> Option<RequestBody> {
        Some(RequestBody::Bytes(self.body.clone()))
    }

    fn content_type(&self) -> Option<String> {
        Some(self.media_type.clone())
    }

    fn action_description(&self) -> String {
        format!(
            "push image manifest for {}/{}:{}",
            self.properties.server_url, self.properties.image_name, self.tag
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output> {
        let expected = Digest::of_bytes(&self.body);
        let received = response.header(DOCKER_CONTENT_DIGEST).map(str::trim).map(str::to_string);
        match received {
            Some(received) if received == expected.as_str() => {}
            Some(received) => self.logger.warning(&format!(
                "Expected image digest {}, but received: {}",
                expected, received
            )),
            None => self.logger.warning(&format!(
                "Expected image digest {}, but received none",
                expected
            )),
        }
        Ok(expected)
    }

    async fn handle_http_error(&self, response: &ErrorResponse) -> Result<Option<Self::Output>> {
        match response.status {
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Err(self.unsupported_format()),
            StatusCode::BAD_REQUEST => match RegistryErrorHandler::single_error_code(&response.body) {
                Some(RegistryErrorCode::ManifestInvalid) | Some(RegistryErrorCode::TagInvalid) => {
                    Err(self.unsupported_format())
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }
}
