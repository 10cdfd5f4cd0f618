//! Registry module for Docker registry interactions
//!
//! Talks the distribution v2 HTTP API: authentication discovery and token exchange,
//! manifest pull/push and blob check/pull/push, with the connection policy (insecure
//! fallback, redirects, error translation) applied uniformly by the endpoint caller.

pub mod auth;
pub mod caller;
pub mod client;
pub mod credential;
pub mod operations;
pub mod transport;

pub use auth::RegistryAuthenticator;
pub use caller::{CallerSettings, RegistryEndpointCaller, RegistryEndpointProvider, RegistryEndpointRequestProperties};
pub use client::{RegistryClient, RegistryClientBuilder};
pub use credential::{Authorization, Credential, CredentialRetriever};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, RequestBody, TlsMode, TransportError};
