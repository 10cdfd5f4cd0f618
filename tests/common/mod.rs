//! Shared fakes for the integration tests
//!
//! [`ScriptedTransport`] replays canned responses in order and records every request.
//! [`InMemoryRegistry`] speaks enough of the distribution API for a full pull and push.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use docker_image_builder::image::digest::Digest;
use docker_image_builder::registry::transport::{
    HttpRequest, HttpResponse, HttpTransport, RequestBody, TlsMode, TransportError,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}

pub fn body_bytes(body: &Option<RequestBody>) -> Bytes {
    match body {
        None => Bytes::new(),
        Some(RequestBody::Bytes(bytes)) => bytes.clone(),
        Some(RequestBody::File { path, .. }) => Bytes::from(std::fs::read(path).unwrap()),
    }
}

/// One canned answer
pub enum Scripted {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Bytes,
    },
    Fail(TransportError),
}

impl Scripted {
    pub fn status(status: u16) -> Self {
        Scripted::Respond {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(self, name: &'static str, value: impl Into<String>) -> Self {
        match self {
            Scripted::Respond {
                status,
                mut headers,
                body,
            } => {
                headers.push((name, value.into()));
                Scripted::Respond { status, headers, body }
            }
            fail => fail,
        }
    }

    pub fn with_body(self, content: impl Into<Bytes>) -> Self {
        match self {
            Scripted::Respond { status, headers, .. } => Scripted::Respond {
                status,
                headers,
                body: content.into(),
            },
            fail => fail,
        }
    }
}

/// A request as the transport saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub url: String,
    pub tls: TlsMode,
    pub authorization: Option<String>,
    pub body: Bytes,
}

#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Scripted>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest, tls: TlsMode) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(Recorded {
            method: request.method.clone(),
            url: request.url.to_string(),
            tls,
            authorization: request
                .headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            body: body_bytes(&request.body),
        });
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request {} {}", request.method, request.url));
        match next {
            Scripted::Fail(error) => Err(error),
            Scripted::Respond { status, headers: pairs, body } => {
                let pairs: Vec<(&str, &str)> = pairs.iter().map(|(name, value)| (*name, value.as_str())).collect();
                Ok(HttpResponse::from_bytes(
                    StatusCode::from_u16(status).unwrap(),
                    headers(&pairs),
                    request.url,
                    body,
                ))
            }
        }
    }
}

#[derive(Default)]
struct RegistryState {
    blobs: HashMap<String, Bytes>,
    manifests: HashMap<(String, String), (String, Bytes)>,
    uploads: HashMap<String, BytesMut>,
    next_upload: usize,
    requests: Vec<String>,
}

/// A registry that keeps blobs and manifests in memory
///
/// Upload locations are returned as relative paths so the client has to resolve them.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

fn respond(request: &HttpRequest, status: StatusCode, pairs: &[(&str, &str)], body: impl Into<Bytes>) -> HttpResponse {
    HttpResponse::from_bytes(status, headers(pairs), request.url.clone(), body)
}

fn not_found(request: &HttpRequest, code: &str) -> HttpResponse {
    let body = format!(r#"{{"errors":[{{"code":"{}","message":"not found"}}]}}"#, code);
    respond(request, StatusCode::NOT_FOUND, &[], body)
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob(&self, content: impl Into<Bytes>) -> Digest {
        let content = content.into();
        let digest = Digest::of_bytes(&content);
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.to_string(), content);
        digest
    }

    pub fn put_manifest(&self, repository: &str, reference: &str, media_type: &str, body: impl Into<Bytes>) {
        self.state.lock().unwrap().manifests.insert(
            (repository.to_string(), reference.to_string()),
            (media_type.to_string(), body.into()),
        );
    }

    pub fn blob(&self, digest: &Digest) -> Option<Bytes> {
        self.state.lock().unwrap().blobs.get(digest.as_str()).cloned()
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<(String, Bytes)> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
    }

    /// Requests seen so far, as `METHOD path`
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        let path = request.url.path().to_string();
        state.requests.push(format!("{} {}", request.method, path));

        let Some(route) = path.strip_prefix("/v2/") else {
            return not_found(request, "NAME_UNKNOWN");
        };
        if route.is_empty() {
            return respond(request, StatusCode::OK, &[], "{}");
        }

        if let Some((repository, upload)) = route.split_once("/blobs/uploads/") {
            return self.handle_upload(&mut state, request, repository, upload);
        }
        if let Some((_, digest)) = route.split_once("/blobs/") {
            let Some(content) = state.blobs.get(digest).cloned() else {
                return if request.method == Method::HEAD {
                    respond(request, StatusCode::NOT_FOUND, &[], Bytes::new())
                } else {
                    not_found(request, "BLOB_UNKNOWN")
                };
            };
            let length = content.len().to_string();
            let body = if request.method == Method::HEAD { Bytes::new() } else { content };
            return respond(request, StatusCode::OK, &[("content-length", &length)], body);
        }
        if let Some((repository, reference)) = route.split_once("/manifests/") {
            let key = (repository.to_string(), reference.to_string());
            if request.method == Method::PUT {
                let body = body_bytes(&request.body);
                let media_type = request
                    .headers
                    .get("content-type")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let digest = Digest::of_bytes(&body).to_string();
                state
                    .manifests
                    .insert((repository.to_string(), digest.clone()), (media_type.clone(), body.clone()));
                state.manifests.insert(key, (media_type, body));
                return respond(request, StatusCode::CREATED, &[("docker-content-digest", &digest)], Bytes::new());
            }
            return match state.manifests.get(&key).cloned() {
                Some((media_type, body)) => respond(request, StatusCode::OK, &[("content-type", &media_type)], body),
                None => not_found(request, "MANIFEST_UNKNOWN"),
            };
        }
        not_found(request, "NAME_UNKNOWN")
    }

    fn handle_upload(
        &self,
        state: &mut RegistryState,
        request: &HttpRequest,
        repository: &str,
        upload: &str,
    ) -> HttpResponse {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        match request.method {
            Method::POST => {
                if let Some(mount) = query.get("mount") {
                    if state.blobs.contains_key(mount) {
                        return respond(request, StatusCode::CREATED, &[], Bytes::new());
                    }
                }
                state.next_upload += 1;
                let id = format!("upload-{}", state.next_upload);
                state.uploads.insert(id.clone(), BytesMut::new());
                let location = format!("/v2/{}/blobs/uploads/{}", repository, id);
                respond(request, StatusCode::ACCEPTED, &[("location", &location)], Bytes::new())
            }
            Method::PATCH => {
                let Some(buffer) = state.uploads.get_mut(upload) else {
                    return not_found(request, "BLOB_UPLOAD_UNKNOWN");
                };
                buffer.extend_from_slice(&body_bytes(&request.body));
                let location = format!("/v2/{}/blobs/uploads/{}?_state=written", repository, upload);
                respond(request, StatusCode::ACCEPTED, &[("location", &location)], Bytes::new())
            }
            Method::PUT => {
                let Some(buffer) = state.uploads.remove(upload) else {
                    return not_found(request, "BLOB_UPLOAD_UNKNOWN");
                };
                let content = buffer.freeze();
                let digest = Digest::of_bytes(&content).to_string();
                if query.get("digest") != Some(&digest) {
                    let body = r#"{"errors":[{"code":"DIGEST_INVALID","message":"digest mismatch"}]}"#;
                    return respond(request, StatusCode::BAD_REQUEST, &[], body);
                }
                state.blobs.insert(digest, content);
                respond(request, StatusCode::CREATED, &[], Bytes::new())
            }
            _ => respond(request, StatusCode::METHOD_NOT_ALLOWED, &[], Bytes::new()),
        }
    }
}

#[async_trait]
impl HttpTransport for InMemoryRegistry {
    async fn send(&self, request: HttpRequest, _tls: TlsMode) -> Result<HttpResponse, TransportError> {
        Ok(self.handle(&request))
    }
}
