//! In-memory model of the image being built, and its translation to and from the JSON
//! documents registries store

use crate::cache::CachedLayer;
use crate::config::{ImageFormat, Port};
use crate::error::{BuilderError, Result};
use crate::image::container_config::{
    ConfigurationObjectTemplate, ContainerConfigurationTemplate, EmptyObject, HistoryEntryTemplate,
    RootFilesystemTemplate,
};
use crate::image::digest::BlobDescriptor;
use crate::image::manifest::ManifestTemplate;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub created: Option<DateTime<Utc>>,
    pub architecture: String,
    pub os: String,
    pub environment: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub program_arguments: Option<Vec<String>>,
    pub exposed_ports: BTreeSet<Port>,
    pub volumes: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
    pub layers: Vec<CachedLayer>,
    pub history: Vec<HistoryEntryTemplate>,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            created: None,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            environment: BTreeMap::new(),
            entrypoint: None,
            program_arguments: None,
            exposed_ports: BTreeSet::new(),
            volumes: BTreeSet::new(),
            labels: BTreeMap::new(),
            working_directory: None,
            user: None,
            layers: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl Image {
    /// Rebuild the model of a pulled image from its container configuration and layers
    ///
    /// Without a configuration (`scratch`) the image has only its layers. The diff ids are
    /// checked only when the configuration lists them, which schema 1 configurations do not.
    pub fn from_container_configuration(
        configuration: Option<&ContainerConfigurationTemplate>,
        layers: Vec<CachedLayer>,
    ) -> Result<Self> {
        let mut image = Image {
            layers,
            ..Image::default()
        };
        let Some(configuration) = configuration else {
            return Ok(image);
        };

        let diff_ids: Vec<_> = image.layers.iter().map(|layer| layer.diff_id().clone()).collect();
        if !configuration.rootfs.diff_ids.is_empty() && configuration.rootfs.diff_ids != diff_ids {
            return Err(BuilderError::registry(
                "read base image configuration",
                "the layer diff ids in the container configuration do not match the pulled layers",
            ));
        }

        if let Some(created) = &configuration.created {
            image.created = DateTime::parse_from_rfc3339(created)
                .ok()
                .map(|created| created.with_timezone(&Utc));
        }
        if !configuration.architecture.is_empty() {
            image.architecture = configuration.architecture.clone();
        }
        if !configuration.os.is_empty() {
            image.os = configuration.os.clone();
        }

        let config = &configuration.config;
        for variable in config.env.iter().flatten() {
            let (name, value) = variable.split_once('=').unwrap_or((variable.as_str(), ""));
            image.environment.insert(name.to_string(), value.to_string());
        }
        image.entrypoint = config.entrypoint.clone();
        image.program_arguments = config.cmd.clone();
        for port in config.exposed_ports.iter().flat_map(|ports| ports.keys()) {
            image.exposed_ports.insert(port.parse()?);
        }
        image.volumes = config
            .volumes
            .iter()
            .flat_map(|volumes| volumes.keys().cloned())
            .collect();
        image.labels = config.labels.clone().unwrap_or_default();
        image.working_directory = config.working_dir.clone().filter(|dir| !dir.is_empty());
        image.user = config.user.clone().filter(|user| !user.is_empty());
        image.history = configuration.history.clone();
        Ok(image)
    }

    pub fn to_container_configuration(&self) -> ContainerConfigurationTemplate {
        let environment: Vec<String> = self
            .environment
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();

        ContainerConfigurationTemplate {
            created: self
                .created
                .map(|created| created.to_rfc3339_opts(SecondsFormat::Secs, true)),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: ConfigurationObjectTemplate {
                env: non_empty(environment),
                entrypoint: self.entrypoint.clone(),
                cmd: self.program_arguments.clone(),
                exposed_ports: non_empty_set(self.exposed_ports.iter().map(Port::to_string)),
                labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
                volumes: non_empty_set(self.volumes.iter().cloned()),
                working_dir: self.working_directory.clone(),
                user: self.user.clone(),
            },
            history: self.history.clone(),
            rootfs: RootFilesystemTemplate {
                diff_ids: self.layers.iter().map(|layer| layer.diff_id().clone()).collect(),
                ..RootFilesystemTemplate::default()
            },
        }
    }

    /// Manifest in `format` for this image, given the descriptor of its pushed configuration
    pub fn to_manifest(&self, format: ImageFormat, container_configuration: &BlobDescriptor) -> ManifestTemplate {
        let layers: Vec<BlobDescriptor> = self.layers.iter().map(CachedLayer::blob_descriptor).collect();
        match format {
            ImageFormat::Docker => ManifestTemplate::v22(container_configuration, &layers),
            ImageFormat::Oci => ManifestTemplate::oci(container_configuration, &layers),
        }
    }
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    (!values.is_empty()).then_some(values)
}

fn non_empty_set(keys: impl Iterator<Item = String>) -> Option<BTreeMap<String, EmptyObject>> {
    let map: BTreeMap<String, EmptyObject> = keys.map(|key| (key, EmptyObject {})).collect();
    (!map.is_empty()).then_some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::manifest::{OCI_MEDIA_TYPE, V22_MEDIA_TYPE};

    const BASE_CONFIGURATION: &str = r#"{
        "created": "2024-01-02T03:04:05Z",
        "architecture": "arm64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/bin", "EMPTY="],
            "Entrypoint": ["/entry"],
            "Cmd": ["serve"],
            "ExposedPorts": {"80/tcp": {}, "53/udp": {}},
            "Volumes": {"/data": {}},
            "WorkingDir": "/srv",
            "User": ""
        },
        "history": [{"created_by": "base"}],
        "rootfs": {"type": "layers", "diff_ids": []}
    }"#;

    #[test]
    fn test_from_container_configuration() {
        let configuration: ContainerConfigurationTemplate = serde_json::from_str(BASE_CONFIGURATION).unwrap();
        let image = Image::from_container_configuration(Some(&configuration), Vec::new()).unwrap();

        assert_eq!(image.architecture, "arm64");
        assert_eq!(image.environment.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(image.environment.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(image.entrypoint, Some(vec!["/entry".to_string()]));
        assert_eq!(image.program_arguments, Some(vec!["serve".to_string()]));
        assert!(image.exposed_ports.contains(&Port::tcp(80)));
        assert!(image.exposed_ports.contains(&Port::udp(53)));
        assert_eq!(image.working_directory.as_deref(), Some("/srv"));
        assert_eq!(image.user, None);
        assert_eq!(image.history.len(), 1);
    }

    #[test]
    fn test_container_configuration_round_trip() {
        let configuration: ContainerConfigurationTemplate = serde_json::from_str(BASE_CONFIGURATION).unwrap();
        let image = Image::from_container_configuration(Some(&configuration), Vec::new()).unwrap();
        let translated = image.to_container_configuration();

        assert_eq!(translated.created.as_deref(), Some("2024-01-02T03:04:05Z"));
        assert_eq!(
            translated.config.env,
            Some(vec!["EMPTY=".to_string(), "PATH=/usr/bin".to_string()])
        );
        assert_eq!(
            Image::from_container_configuration(Some(&translated), Vec::new()).unwrap(),
            image
        );
    }

    #[test]
    fn test_manifest_format() {
        let image = Image::default();
        let config = BlobDescriptor::new(crate::image::digest::Digest::of_bytes(b"{}"), 2);
        assert_eq!(image.to_manifest(ImageFormat::Docker, &config).media_type(), V22_MEDIA_TYPE);
        assert_eq!(image.to_manifest(ImageFormat::Oci, &config).media_type(), OCI_MEDIA_TYPE);
    }
}
