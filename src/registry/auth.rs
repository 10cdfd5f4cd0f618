//! Bearer token authentication against a registry's authorization realm

use crate::error::{BuilderError, Result};
use crate::registry::caller::RegistryEndpointRequestProperties;
use crate::registry::credential::{Authorization, Credential};
use crate::registry::transport::{HttpRequest, HttpTransport, RequestBody, TlsMode, TransportError};
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::Method;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

/// Client id sent when exchanging an OAuth2 refresh token
pub const OAUTH2_CLIENT_ID: &str = "docker-image-builder";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Exchanges credentials for bearer tokens scoped to one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuthenticator {
    realm: String,
    service: String,
    properties: RegistryEndpointRequestProperties,
    allow_insecure: bool,
}

impl RegistryAuthenticator {
    /// Build an authenticator from a `WWW-Authenticate` header
    ///
    /// A `Basic` challenge needs no token exchange and yields `None`.
    pub fn from_challenge(header: &str, properties: &RegistryEndpointRequestProperties) -> Result<Option<Self>> {
        let header = header.trim();
        let (scheme, parameters) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(None);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(BuilderError::AuthenticationFailed {
                registry: properties.server_url.clone(),
                repository: properties.image_name.clone(),
                message: format!("'Bearer' was not found in the 'WWW-Authenticate' header, tried to parse: {}", header),
            });
        }

        let parameters = parse_challenge_parameters(parameters);
        let Some(realm) = parameters.get("realm").filter(|realm| !realm.is_empty()) else {
            return Err(BuilderError::AuthenticationFailed {
                registry: properties.server_url.clone(),
                repository: properties.image_name.clone(),
                message: format!("'realm' was not found in the 'WWW-Authenticate' header, tried to parse: {}", header),
            });
        };
        let service = parameters
            .get("service")
            .cloned()
            .unwrap_or_else(|| properties.server_url.clone());

        Ok(Some(Self {
            realm: realm.clone(),
            service,
            properties: properties.clone(),
            allow_insecure: false,
        }))
    }

    /// Permit fetching tokens from a realm whose certificate cannot be verified
    pub fn with_insecure(mut self, allow_insecure: bool) -> Self {
        self.allow_insecure = allow_insecure;
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn authenticate_pull(
        &self,
        credential: Option<&Credential>,
        transport: &dyn HttpTransport,
    ) -> Result<Authorization> {
        self.authenticate(credential, "pull", transport).await
    }

    pub async fn authenticate_push(
        &self,
        credential: Option<&Credential>,
        transport: &dyn HttpTransport,
    ) -> Result<Authorization> {
        self.authenticate(credential, "pull,push", transport).await
    }

    fn scope(&self, actions: &str) -> String {
        format!("repository:{}:{}", self.properties.image_name, actions)
    }

    fn failed(&self, message: String) -> BuilderError {
        BuilderError::AuthenticationFailed {
            registry: self.properties.server_url.clone(),
            repository: self.properties.image_name.clone(),
            message,
        }
    }

    fn token_request(&self, credential: Option<&Credential>, scope: &str) -> Result<(HttpRequest, String)> {
        let realm = Url::parse(&self.realm).map_err(|e| self.failed(format!("invalid realm '{}': {}", self.realm, e)))?;
        let mut headers = HeaderMap::new();

        if let Some(credential) = credential.filter(|credential| credential.is_oauth2_refresh_token()) {
            let form = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("service", &self.service)
                .append_pair("scope", scope)
                .append_pair("client_id", OAUTH2_CLIENT_ID)
                .append_pair("grant_type", "refresh_token")
                .append_pair("refresh_token", credential.password())
                .finish();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            let parameters = format!("service={}, scope={}, client_id={}", self.service, scope, OAUTH2_CLIENT_ID);
            return Ok((
                HttpRequest {
                    method: Method::POST,
                    url: realm,
                    headers,
                    body: Some(RequestBody::Bytes(Bytes::from(form))),
                },
                parameters,
            ));
        }

        let mut url = realm;
        url.query_pairs_mut()
            .append_pair("service", &self.service)
            .append_pair("scope", scope);
        if let Some(credential) = credential {
            let value = Authorization::from_credential(credential).header_value();
            let value = HeaderValue::from_str(&value).map_err(|_| self.failed("credential cannot be sent as a header".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let parameters = format!("service={}, scope={}", self.service, scope);
        Ok((
            HttpRequest {
                method: Method::GET,
                url,
                headers,
                body: None,
            },
            parameters,
        ))
    }

    async fn authenticate(
        &self,
        credential: Option<&Credential>,
        actions: &str,
        transport: &dyn HttpTransport,
    ) -> Result<Authorization> {
        let scope = self.scope(actions);
        let (request, parameters) = self.token_request(credential, &scope)?;
        let url = request.url.clone();
        tracing::debug!("Requesting {} token from {}", scope, self.realm);

        let response = match transport.send(request.clone(), TlsMode::Verified).await {
            Err(TransportError::Tls(_)) if self.allow_insecure => transport.send(request, TlsMode::Insecure).await,
            other => other,
        }
        .map_err(|e| self.failed(format!("token request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.failed(format!("reading token response from {} failed: {}", url, e)))?;
        if !status.is_success() {
            return Err(self.failed(format!(
                "token request to {} returned {}: {}",
                url,
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| self.failed(format!("invalid token response from {}: {}", url, e)))?;
        match token.token.or(token.access_token) {
            Some(token) => Ok(Authorization::bearer(token)),
            None => Err(self.failed(format!(
                "Did not get token in authentication response from {}; parameters: {}",
                url, parameters
            ))),
        }
    }
}

/// `key="value", key=value` pairs; quoted values may contain commas
fn parse_challenge_parameters(input: &str) -> HashMap<String, String> {
    let mut parameters = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        parameters.insert(key, value);
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> RegistryEndpointRequestProperties {
        RegistryEndpointRequestProperties::new("registry.example", "team/app")
    }

    #[test]
    fn test_parses_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example/token",service="registry.example",scope="repository:team/app:pull,push""#;
        let authenticator = RegistryAuthenticator::from_challenge(header, &properties()).unwrap().unwrap();
        assert_eq!(authenticator.realm(), "https://auth.example/token");
        assert_eq!(authenticator.service(), "registry.example");
    }

    #[test]
    fn test_service_defaults_to_registry() {
        let authenticator = RegistryAuthenticator::from_challenge("bearer realm=https://auth.example/token", &properties())
            .unwrap()
            .unwrap();
        assert_eq!(authenticator.realm(), "https://auth.example/token");
        assert_eq!(authenticator.service(), "registry.example");
    }

    #[test]
    fn test_basic_needs_no_authenticator() {
        assert!(RegistryAuthenticator::from_challenge("BASIC realm=\"x\"", &properties())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rejects_other_schemes_and_missing_realm() {
        let err = RegistryAuthenticator::from_challenge("Digest realm=\"x\"", &properties()).unwrap_err();
        assert!(matches!(err, BuilderError::AuthenticationFailed { .. }));
        assert!(err.to_string().contains("Digest"));

        let err = RegistryAuthenticator::from_challenge("Bearer service=\"x\"", &properties()).unwrap_err();
        assert!(err.to_string().contains("realm"));
    }

    #[test]
    fn test_refresh_token_request_is_form_post() {
        let authenticator = RegistryAuthenticator::from_challenge("Bearer realm=\"https://auth.example/token\"", &properties())
            .unwrap()
            .unwrap();
        let (request, _) = authenticator
            .token_request(Some(&Credential::refresh_token("rt")), "repository:team/app:pull")
            .unwrap();
        assert_eq!(request.method, Method::POST);
        let Some(RequestBody::Bytes(body)) = request.body else {
            panic!("expected form body");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=rt"));
        assert!(body.contains("scope=repository%3Ateam%2Fapp%3Apull"));
        assert!(request.headers.get(AUTHORIZATION).is_none());

        let (request, _) = authenticator
            .token_request(Some(&Credential::new("u", "p")), "repository:team/app:pull")
            .unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.url.as_str(),
            "https://auth.example/token?service=registry.example&scope=repository%3Ateam%2Fapp%3Apull"
        );
        assert!(request.headers.get(AUTHORIZATION).is_some());
    }
}
