mod common;

use common::{Scripted, ScriptedTransport};
use docker_image_builder::BuilderError;
use docker_image_builder::image::digest::Digest;
use docker_image_builder::logging::{EventHandlers, LogEvent, LogLevel, Logger};
use docker_image_builder::registry::transport::{TlsMode, TransportError};
use docker_image_builder::registry::{Authorization, CallerSettings, RegistryClient};
use reqwest::Method;
use std::sync::{Arc, Mutex};

fn client(transport: Arc<ScriptedTransport>, settings: CallerSettings) -> RegistryClient {
    RegistryClient::builder(transport, "registry.example", "team/app")
        .with_settings(settings)
        .build()
}

fn insecure() -> CallerSettings {
    CallerSettings {
        allow_insecure_registries: true,
        ..CallerSettings::default()
    }
}

fn recording_logger() -> (Logger, Arc<Mutex<Vec<LogEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let logger = Logger::new(EventHandlers::new().add_log_handler(move |event: &LogEvent| {
        sink.lock().unwrap().push(event.clone())
    }));
    (logger, events)
}

#[tokio::test]
async fn test_tls_failure_retries_without_verification_then_over_http() {
    let digest = Digest::of_bytes(b"layer");
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::Fail(TransportError::Tls("bad certificate".to_string())),
        Scripted::Fail(TransportError::Tls("bad certificate".to_string())),
        Scripted::status(200).with_header("content-length", "5"),
    ]));
    let client = client(transport.clone(), insecure());

    let found = client.check_blob(&digest, None).await.unwrap();
    assert_eq!(found.map(|descriptor| descriptor.size), Some(5));

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].url.starts_with("https://registry.example/v2/team/app/blobs/"));
    assert_eq!(requests[0].tls, TlsMode::Verified);
    assert!(requests[1].url.starts_with("https://"));
    assert_eq!(requests[1].tls, TlsMode::Insecure);
    assert!(requests[2].url.starts_with("http://registry.example/v2/team/app/blobs/"));
}

#[tokio::test]
async fn test_tls_failure_without_insecure_permission_fails_immediately() {
    let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Fail(TransportError::Tls(
        "bad certificate".to_string(),
    ))]));
    let client = client(transport.clone(), CallerSettings::default());

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::InsecureRegistry { .. }));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_connection_refused_on_default_port_falls_back_to_http() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::Fail(TransportError::ConnectionRefused("refused".to_string())),
        Scripted::status(404),
    ]));
    let client = client(transport.clone(), insecure());

    let found = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap();
    assert_eq!(found, None);
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].url.starts_with("http://"));
}

#[tokio::test]
async fn test_connection_refused_is_reported_when_insecure_is_not_allowed() {
    let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Fail(
        TransportError::ConnectionRefused("refused".to_string()),
    )]));
    let client = client(transport.clone(), CallerSettings::default());

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::Transport { .. }));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_connection_refused_on_explicit_port_does_not_fall_back() {
    let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Fail(
        TransportError::ConnectionRefused("refused".to_string()),
    )]));
    let client = RegistryClient::builder(transport.clone(), "registry.example:5000", "team/app")
        .with_settings(insecure())
        .build();

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::Transport { .. }));
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].url.starts_with("https://registry.example:5000/"));
}

#[tokio::test]
async fn test_insecure_retry_failing_for_other_reasons_does_not_fall_back_to_http() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::Fail(TransportError::Tls("bad certificate".to_string())),
        Scripted::Fail(TransportError::Other("connection reset by peer".to_string())),
    ]));
    let client = client(transport.clone(), insecure());

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::Transport { .. }));
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].tls, TlsMode::Insecure);
    assert!(requests.iter().all(|request| request.url.starts_with("https://")));
}

#[tokio::test]
async fn test_insecure_retry_timing_out_reports_no_response() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::Fail(TransportError::Tls("bad certificate".to_string())),
        Scripted::Fail(TransportError::Timeout("read timed out".to_string())),
    ]));
    let client = client(transport.clone(), insecure());

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::NoResponse { .. }));
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn test_non_tls_failure_skips_the_fallback_ladder() {
    // the repository name mentions ssl; only the failure class matters
    let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Fail(TransportError::Other(
        "dns error: failed to lookup address information".to_string(),
    ))]));
    let client = RegistryClient::builder(transport.clone(), "tls-registry.example", "team/openssl")
        .with_settings(insecure())
        .build();

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::Transport { .. }));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_timeout_maps_to_no_response() {
    let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Fail(TransportError::Timeout(
        "read timed out".to_string(),
    ))]));
    let client = client(transport, CallerSettings::default());

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::NoResponse { .. }));
}

#[tokio::test]
async fn test_redirect_to_other_host_drops_authorization() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(307).with_header("location", "https://storage.example/blob?sig=1"),
        Scripted::status(200).with_header("content-length", "3"),
    ]));
    let client = RegistryClient::builder(transport.clone(), "registry.example", "team/app")
        .with_authorization(Some(Authorization::bearer("secret")))
        .build();

    client.check_blob(&Digest::of_bytes(b"abc"), Some(3)).await.unwrap();
    let requests = transport.requests();
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer secret"));
    assert_eq!(requests[1].url, "https://storage.example/blob?sig=1");
    assert_eq!(requests[1].authorization, None);
}

#[tokio::test]
async fn test_permanent_redirect_is_followed() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(308).with_header("location", "/v2/team/app-moved/blobs/elsewhere"),
        Scripted::status(200).with_header("content-length", "4"),
    ]));
    let client = client(transport.clone(), CallerSettings::default());

    let found = client.check_blob(&Digest::of_bytes(b"abcd"), Some(4)).await.unwrap();
    assert_eq!(found.map(|descriptor| descriptor.size), Some(4));
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].url, "https://registry.example/v2/team/app-moved/blobs/elsewhere");
}

#[tokio::test]
async fn test_redirect_to_plain_http_is_rejected_without_insecure_permission() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(307).with_header("location", "http://registry.example/v2/team/app/blobs/elsewhere"),
    ]));
    let client = client(transport.clone(), CallerSettings::default());

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    match err {
        BuilderError::InsecureRegistry { url } => {
            assert_eq!(url, "http://registry.example/v2/team/app/blobs/elsewhere")
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let responses = (0..3)
        .map(|_| Scripted::status(307).with_header("location", "/v2/team/app/blobs/elsewhere"))
        .collect();
    let transport = Arc::new(ScriptedTransport::new(responses));
    let client = client(
        transport.clone(),
        CallerSettings {
            max_redirects: 2,
            ..CallerSettings::default()
        },
    );

    let err = client.check_blob(&Digest::of_bytes(b"layer"), None).await.unwrap_err();
    assert!(matches!(err, BuilderError::TooManyRedirects { max: 2, .. }));
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn test_unauthorized_and_forbidden_are_typed() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(401).with_body("denied"),
        Scripted::status(403).with_body("denied"),
    ]));
    let client = client(transport, CallerSettings::default());

    let err = client.pull_manifest("1.0").await.unwrap_err();
    assert!(err.is_unauthorized());
    let err = client.pull_manifest("1.0").await.unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn test_unauthorized_over_http_reports_credentials_not_sent() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::Fail(TransportError::ConnectionRefused("refused".to_string())),
        Scripted::status(401),
    ]));
    let client = RegistryClient::builder(transport.clone(), "registry.example", "team/app")
        .with_settings(insecure())
        .with_authorization(Some(Authorization::basic("user", "pass")))
        .build();

    let err = client.pull_manifest("1.0").await.unwrap_err();
    assert!(matches!(err, BuilderError::CredentialsNotSent { .. }));
    assert_eq!(transport.requests()[1].authorization, None);
}

#[tokio::test]
async fn test_manifest_not_found_is_a_registry_error() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(404).with_body(r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#),
    ]));
    let client = client(transport, CallerSettings::default());

    let err = client.pull_manifest("missing").await.unwrap_err();
    assert!(matches!(err, BuilderError::Registry { .. }));
    assert!(err.to_string().contains("manifest unknown"));
}

#[tokio::test]
async fn test_bearer_challenge_yields_authenticator() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(401).with_header(
            "www-authenticate",
            r#"Bearer realm="https://auth.example/token",service="registry.example""#,
        ),
        Scripted::status(200).with_body(r#"{"token":"abc"}"#),
    ]));
    let client = client(transport.clone(), CallerSettings::default());

    let authenticator = client.get_registry_authenticator().await.unwrap().unwrap();
    assert_eq!(authenticator.realm(), "https://auth.example/token");
    let authorization = authenticator.authenticate_push(None, client.transport()).await.unwrap();
    assert_eq!(authorization.header_value(), "Bearer abc");

    let requests = transport.requests();
    assert_eq!(requests[0].method, Method::GET);
    assert!(requests[0].url.ends_with("/v2/"));
    assert!(requests[1].url.contains("scope=repository%3Ateam%2Fapp%3Apull%2Cpush"));
}

#[tokio::test]
async fn test_registry_without_challenge_needs_no_authenticator() {
    let transport = Arc::new(ScriptedTransport::new(vec![Scripted::status(200)]));
    let client = client(transport, CallerSettings::default());
    assert_eq!(client.get_registry_authenticator().await.unwrap(), None);
}

#[tokio::test]
async fn test_manifest_push_warns_once_on_digest_mismatch() {
    let (logger, events) = recording_logger();
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(201).with_header("docker-content-digest", Digest::of_bytes(b"other").to_string()),
    ]));
    let client = RegistryClient::builder(transport, "registry.example", "team/app")
        .with_logger(logger)
        .build();
    let config = docker_image_builder::image::digest::BlobDescriptor::new(Digest::of_bytes(b"{}"), 2);
    let manifest = docker_image_builder::image::ManifestTemplate::v22(&config, &[]);

    let digest = client.push_manifest(&manifest, "1.0").await.unwrap();
    assert_eq!(digest, manifest.digest().unwrap());
    let warnings: Vec<LogEvent> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.level == LogLevel::Warn)
        .cloned()
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.starts_with("Expected image digest"));
}

#[tokio::test]
async fn test_manifest_push_with_matching_digest_is_silent() {
    let (logger, events) = recording_logger();
    let config = docker_image_builder::image::digest::BlobDescriptor::new(Digest::of_bytes(b"{}"), 2);
    let manifest = docker_image_builder::image::ManifestTemplate::v22(&config, &[]);
    let expected = manifest.digest().unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(201).with_header("docker-content-digest", expected.to_string()),
        Scripted::status(201),
    ]));
    let client = RegistryClient::builder(transport, "registry.example", "team/app")
        .with_logger(logger)
        .build();

    assert_eq!(client.push_manifest(&manifest, "1.0").await.unwrap(), expected);
    assert!(events.lock().unwrap().iter().all(|event| event.level != LogLevel::Warn));

    // a missing header is tolerated too, with one warning
    assert_eq!(client.push_manifest(&manifest, "1.1").await.unwrap(), expected);
    let warnings = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.level == LogLevel::Warn)
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn test_manifest_push_rejected_as_unsupported_format() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Scripted::status(400).with_body(r#"{"errors":[{"code":"MANIFEST_INVALID","message":"bad"}]}"#),
    ]));
    let client = client(transport, CallerSettings::default());
    let config = docker_image_builder::image::digest::BlobDescriptor::new(Digest::of_bytes(b"{}"), 2);
    let manifest = docker_image_builder::image::ManifestTemplate::oci(&config, &[]);

    let err = client.push_manifest(&manifest, "1.0").await.unwrap_err();
    assert!(err.to_string().contains("Registry may not support pushing OCI Manifest"));
}
