//! HTTP transport seam for registry calls
//!
//! The endpoint caller only speaks to an [`HttpTransport`]: one request in, one response
//! (or one classified transport failure) out. [`ReqwestTransport`] is the production
//! implementation; tests substitute scripted fakes.

use crate::error::handlers::NetworkErrorHandler;
use crate::error::{BuilderError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::{Method, StatusCode};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

/// A transport failure, classified by how the endpoint caller reacts to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Handshake or certificate verification failed
    Tls(String),
    ConnectionRefused(String),
    Timeout(String),
    BrokenPipe(String),
    Other(String),
}

impl TransportError {
    pub fn message(&self) -> &str {
        match self {
            TransportError::Tls(message)
            | TransportError::ConnectionRefused(message)
            | TransportError::Timeout(message)
            | TransportError::BrokenPipe(message)
            | TransportError::Other(message) => message,
        }
    }

    /// The error surfaced once no fallback applies
    pub fn into_builder_error(self, action: &str) -> BuilderError {
        let action = action.to_string();
        match self {
            TransportError::Timeout(message) => BuilderError::NoResponse { action, message },
            TransportError::BrokenPipe(message) => BuilderError::BrokenPipe { action, message },
            other => BuilderError::Transport {
                action,
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Tls(message) => write!(f, "TLS failure: {}", message),
            TransportError::ConnectionRefused(message) => write!(f, "connection refused: {}", message),
            TransportError::Timeout(message) => write!(f, "timed out: {}", message),
            TransportError::BrokenPipe(message) => write!(f, "broken pipe: {}", message),
            TransportError::Other(message) => f.write_str(message),
        }
    }
}

/// Whether server certificates are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Verified,
    Insecure,
}

/// Request content; files are streamed rather than read into memory
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Bytes),
    File { path: PathBuf, size: u64 },
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Bytes(bytes) => bytes.len() as u64,
            RequestBody::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, TransportError>>;

/// Response whose body has not been read yet
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: BodyStream,
}

impl HttpResponse {
    /// `url` is the URL of the request that produced this response
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            url,
            body,
        }
    }

    pub fn from_bytes(status: StatusCode, headers: HeaderMap, url: Url, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let stream = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self::new(status, headers, url, stream)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH.as_str())?.trim().parse().ok()
    }

    pub fn into_stream(self) -> BodyStream {
        self.body
    }

    pub async fn bytes(self) -> std::result::Result<Bytes, TransportError> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub async fn text(self) -> std::result::Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .finish()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request without following redirects
    async fn send(&self, request: HttpRequest, tls: TlsMode) -> std::result::Result<HttpResponse, TransportError>;
}

/// `reqwest` transport with one verifying and one non-verifying client
pub struct ReqwestTransport {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let build = |accept_invalid_certs: bool| {
            reqwest::Client::builder()
                .user_agent(user_agent)
                .connect_timeout(timeout)
                .read_timeout(timeout)
                .redirect(reqwest::redirect::Policy::none())
                .danger_accept_invalid_certs(accept_invalid_certs)
                .build()
                .map_err(|e| BuilderError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e)))
        };
        Ok(Self {
            verified: build(false)?,
            insecure: build(true)?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest, tls: TlsMode) -> std::result::Result<HttpResponse, TransportError> {
        let client = match tls {
            TlsMode::Verified => &self.verified,
            TlsMode::Insecure => &self.insecure,
        };
        let mut builder = client
            .request(request.method, request.url.clone())
            .headers(request.headers);

        builder = match request.body {
            None => builder,
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes),
            Some(RequestBody::File { path, size }) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| TransportError::Other(format!("cannot open {}: {}", path.display(), e)))?;
                builder
                    .header(CONTENT_LENGTH, size)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::classify(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| NetworkErrorHandler::classify(&e)))
            .boxed();
        Ok(HttpResponse::new(status, headers, request.url, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_from_bytes() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "5".parse().unwrap());
        let url = Url::parse("https://registry.example/v2/").unwrap();
        let response = HttpResponse::from_bytes(StatusCode::OK, headers, url, &b"hello"[..]);
        assert_eq!(response.content_length(), Some(5));
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[test]
    fn test_transport_errors_map_to_dedicated_kinds() {
        assert!(matches!(
            TransportError::Timeout("t".into()).into_builder_error("pull"),
            BuilderError::NoResponse { .. }
        ));
        assert!(matches!(
            TransportError::BrokenPipe("p".into()).into_builder_error("push"),
            BuilderError::BrokenPipe { .. }
        ));
        assert!(matches!(
            TransportError::ConnectionRefused("c".into()).into_builder_error("push"),
            BuilderError::Transport { .. }
        ));
    }
}
