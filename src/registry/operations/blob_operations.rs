//! Blob operations
//!
//! - existence check (HEAD /v2/{name}/blobs/{digest})
//! - download (GET /v2/{name}/blobs/{digest}), verified against the requested digest
//! - three stage upload: initialize (POST, optionally mounting from another repository),
//!   write (PATCH) and commit (PUT with `digest=`)

use crate::error::handlers::{RegistryErrorCode, RegistryErrorHandler};
use crate::error::{BuilderError, Result};
use crate::image::digest::{BlobDescriptor, Digest, DigestWriter};
use crate::logging::Logger;
use crate::registry::caller::{ErrorResponse, RegistryEndpointProvider, RegistryEndpointRequestProperties};
use crate::registry::transport::{HttpResponse, RequestBody};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use url::Url;

/// Callback receiving a byte count
pub type ByteCountListener = Arc<dyn Fn(u64) + Send + Sync>;

/// HEAD check for a blob; `None` means the registry does not have it
pub struct BlobChecker<'a> {
    properties: &'a RegistryEndpointRequestProperties,
    digest: &'a Digest,
    expected_size: Option<u64>,
}

impl<'a> BlobChecker<'a> {
    pub fn new(
        properties: &'a RegistryEndpointRequestProperties,
        digest: &'a Digest,
        expected_size: Option<u64>,
    ) -> Self {
        Self {
            properties,
            digest,
            expected_size,
        }
    }
}

#[async_trait]
impl RegistryEndpointProvider for BlobChecker<'_> {
    type Output = Option<BlobDescriptor>;

    fn http_method(&self) -> Method {
        Method::HEAD
    }

    fn api_route(&self, api_route_base: &Url) -> Result<Url> {
        Ok(api_route_base.join(&format!("{}/blobs/{}", self.properties.image_name, self.digest))?)
    }

    fn action_description(&self) -> String {
        format!(
            "check BLOB exists for {}/{} with digest {}",
            self.properties.server_url, self.properties.image_name, self.digest
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output> {
        let size = response.content_length();
        if let (Some(expected), Some(size)) = (self.expected_size, size) {
            if expected != size {
                return Err(BuilderError::registry(
                    self.action_description(),
                    format!("registry reports size {} but {} was expected", size, expected),
                ));
            }
        }
        Ok(Some(BlobDescriptor::new(
            self.digest.clone(),
            size.or(self.expected_size).unwrap_or(0),
        )))
    }

    async fn handle_http_error(&self, response: &ErrorResponse) -> Result<Option<Self::Output>> {
        if response.status != StatusCode::NOT_FOUND {
            return Ok(None);
        }
        // HEAD responses carry no body, so an empty 404 is the normal "not found"
        if response.body.trim().is_empty()
            || RegistryErrorHandler::single_error_code(&response.body) == Some(RegistryErrorCode::BlobUnknown)
        {
            return Ok(Some(None));
        }
        Ok(None)
    }
}

/// Streams a blob into a destination, verifying its digest once the stream ends
pub struct BlobPuller<'a, W> {
    properties: &'a RegistryEndpointRequestProperties,
    digest: &'a Digest,
    destination: Mutex<W>,
    size_listener: ByteCountListener,
    write_listener: ByteCountListener,
}

impl<'a, W: AsyncWrite + Send + Unpin> BlobPuller<'a, W> {
    pub fn new(
        properties: &'a RegistryEndpointRequestProperties,
        digest: &'a Digest,
        destination: W,
        size_listener: ByteCountListener,
        write_listener: ByteCountListener,
    ) -> Self {
        Self {
            properties,
            digest,
            destination: Mutex::new(destination),
            size_listener,
            write_listener,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> RegistryEndpointProvider for BlobPuller<'_, W> {
    type Output = BlobDescriptor;

    fn http_method(&self) -> Method {
        Method::GET
    }

    fn api_route(&self, api_route_base: &Url) -> Result<Url> {
        Ok(api_route_base.join(&format!("{}/blobs/{}", self.properties.image_name, self.digest))?)
    }

    fn action_description(&self) -> String {
        format!(
            "pull BLOB for {}/{} with digest {}",
            self.properties.server_url, self.properties.image_name, self.digest
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output> {
        if let Some(size) = response.content_length() {
            (self.size_listener)(size);
        }

        let action = self.action_description();
        let mut destination = self.destination.lock().await;
        let mut writer = DigestWriter::new(&mut *destination);
        let mut body = response.into_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.into_builder_error(&action))?;
            writer.write_all(&chunk).await?;
            (self.write_listener)(chunk.len() as u64);
        }
        writer.flush().await?;

        let descriptor = writer.descriptor();
        if &descriptor.digest != self.digest {
            return Err(BuilderError::UnexpectedBlobDigest {
                expected: self.digest.to_string(),
                received: descriptor.digest.to_string(),
            });
        }
        Ok(descriptor)
    }
}

/// First upload stage; yields the upload location, or `None` when the blob already exists
pub struct BlobPushInitializer<'a> {
    properties: &'a RegistryEndpointRequestProperties,
    digest: &'a Digest,
    source_repository: Option<&'a str>,
    logger: &'a Logger,
}

impl<'a> BlobPushInitializer<'a> {
    pub fn new(
        properties: &'a RegistryEndpointRequestProperties,
        digest: &'a Digest,
        source_repository: Option<&'a str>,
        logger: &'a Logger,
    ) -> Self {
        Self {
            properties,
            digest,
            source_repository,
            logger,
        }
    }
}

#[async_trait]
impl RegistryEndpointProvider for BlobPushInitializer<'_> {
    type Output = Option<Url>;

    fn http_method(&self) -> Method {
        Method::POST
    }

    fn api_route(&self, api_route_base: &Url) -> Result<Url> {
        let mut url = api_route_base.join(&format!("{}/blobs/uploads/", self.properties.image_name))?;
        if let Some(source) = self.source_repository {
            url.query_pairs_mut()
                .append_pair("mount", self.digest.as_str())
                .append_pair("from", source);
        }
        Ok(url)
    }

    fn content(&self) -> Option<RequestBody> {
        Some(RequestBody::Bytes(Bytes::new()))
    }

    fn action_description(&self) -> String {
        format!(
            "push BLOB for {}/{} with digest {}",
            self.properties.server_url, self.properties.image_name, self.digest
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output> {
        match response.status() {
            StatusCode::CREATED => Ok(None),
            StatusCode::ACCEPTED => {
                if let Some(source) = self.source_repository {
                    self.logger.debug(&format!(
                        "Could not mount {} from {}; uploading it instead",
                        self.digest, source
                    ));
                }
                upload_location(&response, &self.action_description()).map(Some)
            }
            status => Err(BuilderError::registry(
                self.action_description(),
                format!("received unrecognized status code {}", status.as_u16()),
            )),
        }
    }
}

/// Second upload stage; yields the location to commit to
pub struct BlobPushWriter<'a> {
    properties: &'a RegistryEndpointRequestProperties,
    digest: &'a Digest,
    location: Url,
    blob: RequestBody,
    progress: Option<ByteCountListener>,
}

impl<'a> BlobPushWriter<'a> {
    pub fn new(
        properties: &'a RegistryEndpointRequestProperties,
        digest: &'a Digest,
        location: Url,
        blob: RequestBody,
        progress: Option<ByteCountListener>,
    ) -> Self {
        Self {
            properties,
            digest,
            location,
            blob,
            progress,
        }
    }
}

#[async_trait]
impl RegistryEndpointProvider for BlobPushWriter<'_> {
    type Output = Url;

    fn http_method(&self) -> Method {
        Method::PATCH
    }

    fn api_route(&self, _api_route_base: &Url) -> Result<Url> {
        Ok(self.location.clone())
    }

    fn content(&self) -> Option<RequestBody> {
        Some(self.blob.clone())
    }

    fn content_type(&self) -> Option<String> {
        Some("application/octet-stream".to_string())
    }

    fn action_description(&self) -> String {
        format!(
            "push BLOB for {}/{} with digest {}",
            self.properties.server_url, self.properties.image_name, self.digest
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Self::Output> {
        if let Some(progress) = &self.progress {
            progress(self.blob.len());
        }
        upload_location(&response, &self.action_description())
    }
}

/// Final upload stage
pub struct BlobPushCommitter<'a> {
    properties: &'a RegistryEndpointRequestProperties,
    digest: &'a Digest,
    location: Url,
}

impl<'a> BlobPushCommitter<'a> {
    pub fn new(properties: &'a RegistryEndpointRequestProperties, digest: &'a Digest, location: Url) -> Self {
        Self {
            properties,
            digest,
            location,
        }
    }
}

#[async_trait]
impl RegistryEndpointProvider for BlobPushCommitter<'_> {
    type Output = ();

    fn http_method(&self) -> Method {
        Method::PUT
    }

    fn api_route(&self, _api_route_base: &Url) -> Result<Url> {
        let mut url = self.location.clone();
        url.query_pairs_mut().append_pair("digest", self.digest.as_str());
        Ok(url)
    }

    fn content(&self) -> Option<RequestBody> {
        Some(RequestBody::Bytes(Bytes::new()))
    }

    fn action_description(&self) -> String {
        format!(
            "push BLOB for {}/{} with digest {}",
            self.properties.server_url, self.properties.image_name, self.digest
        )
    }

    async fn handle_response(&self, _response: HttpResponse) -> Result<Self::Output> {
        Ok(())
    }
}

/// The `Location` header resolved against the URL of the request that returned it
fn upload_location(response: &HttpResponse, action: &str) -> Result<Url> {
    let Some(location) = response.header(LOCATION.as_str()) else {
        return Err(BuilderError::registry(action, "Location header not found in upload response"));
    };
    Ok(response.url().join(location)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        let properties = RegistryEndpointRequestProperties::new("registry.example", "team/app");
        let digest = Digest::of_bytes(b"x");
        let base = Url::parse("https://registry.example/v2/").unwrap();
        let logger = Logger::silent();

        let checker = BlobChecker::new(&properties, &digest, None);
        assert_eq!(
            checker.api_route(&base).unwrap().as_str(),
            format!("https://registry.example/v2/team/app/blobs/{}", digest)
        );

        let initializer = BlobPushInitializer::new(&properties, &digest, Some("base/image"), &logger);
        let url = initializer.api_route(&base).unwrap();
        assert_eq!(url.path(), "/v2/team/app/blobs/uploads/");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("mount".to_string(), digest.to_string()),
                ("from".to_string(), "base/image".to_string())
            ]
        );

        let committer = BlobPushCommitter::new(
            &properties,
            &digest,
            Url::parse("https://registry.example/upload/1?_state=abc").unwrap(),
        );
        let url = committer.api_route(&base).unwrap();
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(query[0], ("_state".to_string(), "abc".to_string()));
        assert_eq!(query[1], ("digest".to_string(), digest.to_string()));
    }
}
