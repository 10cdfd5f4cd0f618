//! Standardized handling of registry error bodies and transport failures

use crate::error::BuilderError;
use crate::registry::transport::TransportError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::error::Error as StdError;
use std::str::FromStr;

/// `{"errors":[{"code":"...","message":"..."}]}` as returned by distribution registries
#[derive(Debug, Default, Deserialize)]
pub struct ErrorResponseTemplate {
    #[serde(default)]
    pub errors: Vec<ErrorEntryTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEntryTemplate {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Error codes defined by the distribution API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    ManifestUnverified,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    TagInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    TooManyRequests,
}

impl FromStr for RegistryErrorCode {
    type Err = ();

    fn from_str(code: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match code {
            "BLOB_UNKNOWN" => RegistryErrorCode::BlobUnknown,
            "BLOB_UPLOAD_INVALID" => RegistryErrorCode::BlobUploadInvalid,
            "BLOB_UPLOAD_UNKNOWN" => RegistryErrorCode::BlobUploadUnknown,
            "DIGEST_INVALID" => RegistryErrorCode::DigestInvalid,
            "MANIFEST_BLOB_UNKNOWN" => RegistryErrorCode::ManifestBlobUnknown,
            "MANIFEST_INVALID" => RegistryErrorCode::ManifestInvalid,
            "MANIFEST_UNKNOWN" => RegistryErrorCode::ManifestUnknown,
            "MANIFEST_UNVERIFIED" => RegistryErrorCode::ManifestUnverified,
            "NAME_INVALID" => RegistryErrorCode::NameInvalid,
            "NAME_UNKNOWN" => RegistryErrorCode::NameUnknown,
            "SIZE_INVALID" => RegistryErrorCode::SizeInvalid,
            "TAG_INVALID" => RegistryErrorCode::TagInvalid,
            "UNAUTHORIZED" => RegistryErrorCode::Unauthorized,
            "DENIED" => RegistryErrorCode::Denied,
            "UNSUPPORTED" => RegistryErrorCode::Unsupported,
            "TOOMANYREQUESTS" => RegistryErrorCode::TooManyRequests,
            _ => return Err(()),
        })
    }
}

/// Turns registry error responses into actionable [`BuilderError`]s
pub struct RegistryErrorHandler;

impl RegistryErrorHandler {
    /// Parse the error entries of a response body, `None` when the body is not an error document
    pub fn parse_errors(body: &str) -> Option<Vec<ErrorEntryTemplate>> {
        serde_json::from_str::<ErrorResponseTemplate>(body)
            .ok()
            .map(|template| template.errors)
    }

    /// The error code of a body carrying exactly one error entry
    pub fn single_error_code(body: &str) -> Option<RegistryErrorCode> {
        let errors = Self::parse_errors(body)?;
        match errors.as_slice() {
            [only] => only.code.as_deref()?.parse().ok(),
            _ => None,
        }
    }

    /// Build the error for a 400/404/405 response from the structured reasons in its body
    pub fn registry_error(action: &str, status: StatusCode, body: &str) -> BuilderError {
        let reasons = match Self::parse_errors(body) {
            Some(errors) if !errors.is_empty() => errors
                .iter()
                .map(|entry| Self::reason(entry.code.as_deref(), entry.message.as_deref()))
                .collect::<Vec<_>>()
                .join(", "),
            _ => format!(
                "registry returned error code {}; possible causes include invalid or wrong \
                 reference. Actual error output follows:\n{}",
                status.as_u16(),
                body
            ),
        };
        BuilderError::registry(action, reasons)
    }

    fn reason(code: Option<&str>, message: Option<&str>) -> String {
        let message = message.unwrap_or("no details");
        let Some(code) = code else {
            return format!("unknown: {}", message);
        };
        match code.parse::<RegistryErrorCode>() {
            Ok(RegistryErrorCode::ManifestInvalid) | Ok(RegistryErrorCode::BlobUnknown) => {
                format!("{} (something went wrong)", message)
            }
            Ok(RegistryErrorCode::ManifestUnknown)
            | Ok(RegistryErrorCode::ManifestUnverified)
            | Ok(RegistryErrorCode::TagInvalid)
            | Ok(RegistryErrorCode::NameInvalid)
            | Ok(RegistryErrorCode::NameUnknown)
            | Ok(RegistryErrorCode::DigestInvalid) => message.to_string(),
            Ok(_) => format!("other: {}", message),
            Err(()) => format!("unknown: {}", message),
        }
    }
}

/// Words that only appear in the messages of TLS backend errors
const TLS_MARKERS: &[&str] = &["certificate", "tls", "ssl", "handshake", "unknownissuer"];

/// Words of resolver failures; a host that does not resolve is not a TLS problem
const DNS_MARKERS: &[&str] = &["dns error", "failed to lookup address", "name or service not known"];

/// Transport failure categorization
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Classify a `reqwest` failure into the classes the endpoint caller reacts to
    ///
    /// Only the causes are inspected. The top-level message embeds the request URL, and a
    /// host or repository name must not decide the class.
    pub fn classify(error: &reqwest::Error) -> TransportError {
        let description = Self::describe_chain(error);
        if error.is_timeout() {
            return TransportError::Timeout(description);
        }
        Self::classify_causes(error.source(), description)
    }

    /// Classify by walking a chain of underlying errors; `description` is only carried along
    pub fn classify_causes(cause: Option<&(dyn StdError + 'static)>, description: String) -> TransportError {
        let mut messages = Vec::new();
        let mut source = cause;
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        return TransportError::ConnectionRefused(description);
                    }
                    std::io::ErrorKind::BrokenPipe => {
                        return TransportError::BrokenPipe(description);
                    }
                    std::io::ErrorKind::TimedOut => return TransportError::Timeout(description),
                    _ => {}
                }
            }
            messages.push(err.to_string().to_lowercase());
            source = err.source();
        }

        let mentions = |markers: &[&str]| {
            messages
                .iter()
                .any(|message| markers.iter().any(|marker| message.contains(marker)))
        };
        if mentions(DNS_MARKERS) {
            TransportError::Other(description)
        } else if mentions(TLS_MARKERS) {
            TransportError::Tls(description)
        } else if mentions(&["connection refused"]) {
            TransportError::ConnectionRefused(description)
        } else if mentions(&["broken pipe"]) {
            TransportError::BrokenPipe(description)
        } else {
            TransportError::Other(description)
        }
    }

    fn describe_chain(error: &reqwest::Error) -> String {
        let mut description = error.to_string();
        let mut source = error.source();
        while let Some(err) = source {
            description.push_str(": ");
            description.push_str(&err.to_string());
            source = err.source();
        }
        description
    }
}
