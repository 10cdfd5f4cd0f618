//! Image manifest JSON templates
//!
//! Three manifest shapes are understood: the legacy schema 1 format, Docker schema 2 and
//! the OCI image manifest. [`ManifestTemplate`] is the closed set of the three; the format
//! is decided once, when the JSON is parsed.

use crate::error::{BuilderError, Result};
use crate::image::container_config::{ContainerConfigurationTemplate, HistoryEntryTemplate};
use crate::image::digest::{BlobDescriptor, Digest};
use serde::{Deserialize, Serialize};

pub const V21_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const V21_JSON_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const V22_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const V22_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const V22_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media types sent in `Accept` when pulling a manifest
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_MEDIA_TYPE,
    V22_MEDIA_TYPE,
    V21_MEDIA_TYPE,
    V21_JSON_MEDIA_TYPE,
];

/// `{mediaType, digest, size}` reference to a blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptorTemplate {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl ContentDescriptorTemplate {
    pub fn new(media_type: &str, descriptor: &BlobDescriptor) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            urls: None,
        }
    }
}

/// Legacy schema 1 manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21ManifestTemplate {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub fs_layers: Vec<V21LayerTemplate>,
    #[serde(default)]
    pub history: Vec<V21HistoryTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21LayerTemplate {
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V21HistoryTemplate {
    /// A JSON document embedded as a string
    pub v1_compatibility: String,
}

/// The fields of a `v1Compatibility` document used to rebuild history
#[derive(Deserialize)]
struct V1CompatibilityTemplate {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    container_config: Option<V1ContainerConfigTemplate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct V1ContainerConfigTemplate {
    #[serde(default)]
    cmd: Option<Vec<String>>,
}

impl V21ManifestTemplate {
    /// The container configuration embedded in the newest `v1Compatibility` document, with
    /// one history entry per layer from the bottom up
    pub fn container_configuration(&self) -> Result<Option<ContainerConfigurationTemplate>> {
        let Some(newest) = self.history.first() else {
            return Ok(None);
        };
        let mut configuration: ContainerConfigurationTemplate = serde_json::from_str(&newest.v1_compatibility)?;
        configuration.history = self
            .history
            .iter()
            .rev()
            .map(|entry| {
                let v1: V1CompatibilityTemplate = serde_json::from_str(&entry.v1_compatibility)?;
                Ok(HistoryEntryTemplate {
                    created: v1.created,
                    created_by: v1.container_config.and_then(|config| config.cmd).map(|cmd| cmd.join(" ")),
                    ..HistoryEntryTemplate::default()
                })
            })
            .collect::<Result<_>>()?;
        Ok(Some(configuration))
    }
}

/// Docker schema 2 manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V22ManifestTemplate {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ContentDescriptorTemplate,
    #[serde(default)]
    pub layers: Vec<ContentDescriptorTemplate>,
}

/// OCI image manifest; `mediaType` is optional in this format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifestTemplate {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: ContentDescriptorTemplate,
    #[serde(default)]
    pub layers: Vec<ContentDescriptorTemplate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestTemplate {
    V21(V21ManifestTemplate),
    V22(V22ManifestTemplate),
    Oci(OciManifestTemplate),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    schema_version: Option<u64>,
    media_type: Option<String>,
}

impl ManifestTemplate {
    /// Select the manifest shape from `schemaVersion`, `mediaType` and, for OCI manifests
    /// without a `mediaType`, the response content type
    pub fn from_json(json: &[u8], content_type: Option<&str>) -> Result<Self> {
        let shape: ManifestShape = serde_json::from_slice(json)?;
        let content_type = content_type.map(|value| value.split(';').next().unwrap_or("").trim());

        match (shape.schema_version, shape.media_type.as_deref()) {
            (Some(1), _) => Ok(ManifestTemplate::V21(serde_json::from_slice(json)?)),
            (Some(2), Some(V22_MEDIA_TYPE)) => Ok(ManifestTemplate::V22(serde_json::from_slice(json)?)),
            (Some(2), Some(OCI_MEDIA_TYPE)) => Ok(ManifestTemplate::Oci(serde_json::from_slice(json)?)),
            (Some(2), None) if content_type == Some(OCI_MEDIA_TYPE) => {
                Ok(ManifestTemplate::Oci(serde_json::from_slice(json)?))
            }
            (Some(version), media_type) => Err(BuilderError::UnknownManifestFormat(format!(
                "schemaVersion {} with mediaType {}",
                version,
                media_type.unwrap_or("<none>")
            ))),
            (None, _) => Err(BuilderError::UnknownManifestFormat(
                "manifest has no schemaVersion".to_string(),
            )),
        }
    }

    pub fn v22(config: &BlobDescriptor, layers: &[BlobDescriptor]) -> Self {
        ManifestTemplate::V22(V22ManifestTemplate {
            schema_version: 2,
            media_type: V22_MEDIA_TYPE.to_string(),
            config: ContentDescriptorTemplate::new(V22_CONFIG_MEDIA_TYPE, config),
            layers: layers
                .iter()
                .map(|layer| ContentDescriptorTemplate::new(V22_LAYER_MEDIA_TYPE, layer))
                .collect(),
        })
    }

    pub fn oci(config: &BlobDescriptor, layers: &[BlobDescriptor]) -> Self {
        ManifestTemplate::Oci(OciManifestTemplate {
            schema_version: 2,
            media_type: Some(OCI_MEDIA_TYPE.to_string()),
            config: ContentDescriptorTemplate::new(OCI_CONFIG_MEDIA_TYPE, config),
            layers: layers
                .iter()
                .map(|layer| ContentDescriptorTemplate::new(OCI_LAYER_MEDIA_TYPE, layer))
                .collect(),
        })
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            ManifestTemplate::V21(manifest) => manifest.schema_version,
            ManifestTemplate::V22(manifest) => manifest.schema_version,
            ManifestTemplate::Oci(manifest) => manifest.schema_version,
        }
    }

    /// Content type to push the manifest with
    pub fn media_type(&self) -> &str {
        match self {
            ManifestTemplate::V21(_) => V21_MEDIA_TYPE,
            ManifestTemplate::V22(manifest) => &manifest.media_type,
            ManifestTemplate::Oci(manifest) => manifest.media_type.as_deref().unwrap_or(OCI_MEDIA_TYPE),
        }
    }

    /// The container configuration blob; schema 1 manifests embed theirs in the history,
    /// see [`V21ManifestTemplate::container_configuration`]
    pub fn container_configuration(&self) -> Option<&ContentDescriptorTemplate> {
        match self {
            ManifestTemplate::V21(_) => None,
            ManifestTemplate::V22(manifest) => Some(&manifest.config),
            ManifestTemplate::Oci(manifest) => Some(&manifest.config),
        }
    }

    /// Layer digests ordered from the bottom layer up, with sizes when the manifest records them
    pub fn layers(&self) -> Vec<(Digest, Option<u64>)> {
        match self {
            ManifestTemplate::V21(manifest) => manifest
                .fs_layers
                .iter()
                .rev()
                .map(|layer| (layer.blob_sum.clone(), None))
                .collect(),
            ManifestTemplate::V22(manifest) => descriptor_layers(&manifest.layers),
            ManifestTemplate::Oci(manifest) => descriptor_layers(&manifest.layers),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(match self {
            ManifestTemplate::V21(manifest) => serde_json::to_vec(manifest)?,
            ManifestTemplate::V22(manifest) => serde_json::to_vec(manifest)?,
            ManifestTemplate::Oci(manifest) => serde_json::to_vec(manifest)?,
        })
    }

    /// Digest of the serialized manifest, the identifier registries address it by
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_bytes(&self.to_json()?))
    }
}

fn descriptor_layers(layers: &[ContentDescriptorTemplate]) -> Vec<(Digest, Option<u64>)> {
    layers
        .iter()
        .map(|layer| (layer.digest.clone(), Some(layer.size)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    #[test]
    fn test_sniffs_v22() {
        let json = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"{}","digest":"{}","size":7}},"layers":[{{"mediaType":"{}","digest":"{}","size":100}}]}}"#,
            V22_MEDIA_TYPE,
            V22_CONFIG_MEDIA_TYPE,
            digest('a'),
            V22_LAYER_MEDIA_TYPE,
            digest('b')
        );
        let manifest = ManifestTemplate::from_json(json.as_bytes(), None).unwrap();
        assert!(matches!(manifest, ManifestTemplate::V22(_)));
        assert_eq!(manifest.container_configuration().unwrap().size, 7);
        assert_eq!(manifest.layers(), vec![(digest('b').parse().unwrap(), Some(100))]);
    }

    #[test]
    fn test_sniffs_oci_from_content_type() {
        let json = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"{}","digest":"{}","size":7}},"layers":[]}}"#,
            OCI_CONFIG_MEDIA_TYPE,
            digest('a')
        );
        let with_header = format!("{}; charset=utf-8", OCI_MEDIA_TYPE);
        let manifest = ManifestTemplate::from_json(json.as_bytes(), Some(&with_header)).unwrap();
        assert!(matches!(manifest, ManifestTemplate::Oci(_)));
        assert_eq!(manifest.media_type(), OCI_MEDIA_TYPE);

        assert!(matches!(
            ManifestTemplate::from_json(json.as_bytes(), None),
            Err(BuilderError::UnknownManifestFormat(_))
        ));
    }

    #[test]
    fn test_v21_layers_are_reversed() {
        let json = format!(
            r#"{{"schemaVersion":1,"name":"a/b","fsLayers":[{{"blobSum":"{}"}},{{"blobSum":"{}"}}],"history":[{{"v1Compatibility":"{{}}"}}]}}"#,
            digest('1'),
            digest('2')
        );
        let manifest = ManifestTemplate::from_json(json.as_bytes(), None).unwrap();
        assert_eq!(manifest.schema_version(), 1);
        let layers: Vec<String> = manifest.layers().into_iter().map(|(d, _)| d.to_string()).collect();
        assert_eq!(layers, vec![digest('2'), digest('1')]);
        assert!(manifest.container_configuration().is_none());
    }

    #[test]
    fn test_v21_configuration_comes_from_newest_history_entry() {
        let newest = serde_json::json!({
            "id": "b",
            "parent": "a",
            "created": "2020-01-02T00:00:00Z",
            "architecture": "arm64",
            "os": "linux",
            "container_config": {"Cmd": ["/bin/sh", "-c", "#(nop) CMD [\"--serve\"]"]},
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Entrypoint": ["/bin/base"],
                "Cmd": ["--serve"],
                "ExposedPorts": {"8080/tcp": {}},
                "WorkingDir": "/srv",
                "User": "daemon"
            }
        });
        let oldest = serde_json::json!({"id": "a", "created": "2020-01-01T00:00:00Z", "container_config": {"Cmd": null}});
        let manifest = V21ManifestTemplate {
            schema_version: 1,
            name: Some("team/base".to_string()),
            tag: Some("1".to_string()),
            architecture: Some("arm64".to_string()),
            fs_layers: vec![
                V21LayerTemplate { blob_sum: digest('2').parse().unwrap() },
                V21LayerTemplate { blob_sum: digest('1').parse().unwrap() },
            ],
            history: vec![
                V21HistoryTemplate { v1_compatibility: newest.to_string() },
                V21HistoryTemplate { v1_compatibility: oldest.to_string() },
            ],
        };

        let configuration = manifest.container_configuration().unwrap().unwrap();
        assert_eq!(configuration.architecture, "arm64");
        assert_eq!(configuration.config.entrypoint, Some(vec!["/bin/base".to_string()]));
        assert_eq!(configuration.config.cmd, Some(vec!["--serve".to_string()]));
        assert_eq!(configuration.config.working_dir.as_deref(), Some("/srv"));
        assert_eq!(configuration.config.user.as_deref(), Some("daemon"));
        assert!(configuration.config.exposed_ports.unwrap().contains_key("8080/tcp"));
        assert!(configuration.rootfs.diff_ids.is_empty());

        assert_eq!(configuration.history.len(), 2);
        assert_eq!(configuration.history[0].created.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(configuration.history[0].created_by, None);
        assert_eq!(
            configuration.history[1].created_by.as_deref(),
            Some("/bin/sh -c #(nop) CMD [\"--serve\"]")
        );
    }

    #[test]
    fn test_unknown_formats() {
        for json in [
            r#"{"schemaVersion":3}"#,
            r#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.list.v2+json"}"#,
            r#"{"layers":[]}"#,
        ] {
            assert!(
                matches!(
                    ManifestTemplate::from_json(json.as_bytes(), None),
                    Err(BuilderError::UnknownManifestFormat(_))
                ),
                "accepted {}",
                json
            );
        }
    }

    #[test]
    fn test_built_manifests_serialize_with_media_types() {
        let config = BlobDescriptor::new(Digest::of_bytes(b"config"), 6);
        let layer = BlobDescriptor::new(Digest::of_bytes(b"layer"), 5);
        let json = ManifestTemplate::oci(&config, &[layer]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["mediaType"], OCI_MEDIA_TYPE);
        assert_eq!(value["config"]["mediaType"], OCI_CONFIG_MEDIA_TYPE);
        assert_eq!(value["layers"][0]["mediaType"], OCI_LAYER_MEDIA_TYPE);
        assert_eq!(value["layers"][0]["size"], 5);
    }
}
