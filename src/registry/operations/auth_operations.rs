//! Authentication method discovery (GET /v2/)

use crate::error::{BuilderError, Result};
use crate::registry::auth::RegistryAuthenticator;
use crate::registry::caller::{ErrorResponse, RegistryEndpointProvider, RegistryEndpointRequestProperties};
use crate::registry::transport::HttpResponse;
use async_trait::async_trait;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Method, StatusCode};
use url::Url;

/// Finds out how a registry wants to be authenticated against
///
/// `None` means the registry needs no token exchange.
pub struct AuthenticationMethodRetriever<'a> {
    properties: &'a RegistryEndpointRequestProperties,
}

impl<'a> AuthenticationMethodRetriever<'a> {
    pub fn new(properties: &'a RegistryEndpointRequestProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl RegistryEndpointProvider for AuthenticationMethodRetriever<'_> {
    type Output = Option<RegistryAuthenticator>;

    fn http_method(&self) -> Method {
        Method::GET
    }

    fn api_route(&self, api_route_base: &Url) -> Result<Url> {
        Ok(api_route_base.clone())
    }

    fn action_description(&self) -> String {
        format!("retrieve authentication method for {}", self.properties.server_url)
    }

    async fn handle_response(&self, _response: HttpResponse) -> Result<Self::Output> {
        Ok(None)
    }

    async fn handle_http_error(&self, response: &ErrorResponse) -> Result<Option<Self::Output>> {
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let Some(challenge) = response.header(WWW_AUTHENTICATE.as_str()) else {
            return Err(BuilderError::registry(
                self.action_description(),
                "'WWW-Authenticate' header not found in 401 response",
            ));
        };
        RegistryAuthenticator::from_challenge(challenge, self.properties).map(Some)
    }
}
