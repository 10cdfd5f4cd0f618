//! `docker load` compatible image tarball, and the local engine it is loaded into

use crate::error::{BuilderError, Result};
use crate::image::blob::Blob;
use crate::image::digest::{BlobDescriptor, DigestWriter};
use crate::image::model::Image;
use crate::image::reference::ImageReference;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{ChildStdin, Command};
use tokio_util::io::SyncIoBridge;

const CONTAINER_CONFIGURATION_FILE: &str = "config.json";
const MANIFEST_FILE: &str = "manifest.json";
const LAYER_FILE_EXTENSION: &str = ".tar.gz";

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DockerLoadManifestEntryTemplate {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// An image serialized the way `docker save` writes it
#[derive(Debug, Clone)]
pub struct ImageTarball {
    image: Image,
    reference: ImageReference,
    tags: Vec<String>,
}

impl ImageTarball {
    /// `tags` are the tags of `reference` the loaded image is known by
    pub fn new(image: Image, reference: ImageReference, tags: Vec<String>) -> Self {
        Self { image, reference, tags }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Names the local engine should tag the image with
    pub fn repo_tags(&self) -> Vec<String> {
        let name = if self.reference.is_default_registry() {
            self.reference
                .repository()
                .strip_prefix("library/")
                .unwrap_or(self.reference.repository())
                .to_string()
        } else {
            format!("{}/{}", self.reference.registry(), self.reference.repository())
        };
        self.tags.iter().map(|tag| format!("{}:{}", name, tag)).collect()
    }

    fn write_archive<W: Write>(&self, archive: &mut tar::Builder<W>) -> Result<()> {
        let mut layers = Vec::with_capacity(self.image.layers.len());
        for layer in &self.image.layers {
            let name = format!("{}{}", layer.digest().hash(), LAYER_FILE_EXTENSION);
            if !layers.contains(&name) {
                archive.append_path_with_name(layer.path(), &name)?;
            }
            layers.push(name);
        }

        let configuration = serde_json::to_vec(&self.image.to_container_configuration())?;
        append_bytes(archive, CONTAINER_CONFIGURATION_FILE, &configuration)?;

        let manifest = serde_json::to_vec(&[DockerLoadManifestEntryTemplate {
            config: CONTAINER_CONFIGURATION_FILE.to_string(),
            repo_tags: self.repo_tags(),
            layers,
        }])?;
        append_bytes(archive, MANIFEST_FILE, &manifest)
    }

    /// Write the tarball to a file, returning its descriptor
    pub fn write_to_file(&self, path: &Path) -> Result<BlobDescriptor> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = io::BufWriter::new(File::create(path)?);
        let descriptor = self.write_to(&mut file)?;
        file.flush()?;
        Ok(descriptor)
    }
}

fn append_bytes<W: Write>(archive: &mut tar::Builder<W>, name: &str, content: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    archive.append_data(&mut header, name, content)?;
    Ok(())
}

impl Blob for ImageTarball {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut writer = DigestWriter::new(out);
        let mut archive = tar::Builder::new(&mut writer);
        self.write_archive(&mut archive)?;
        archive.into_inner()?;
        writer.flush()?;
        Ok(writer.descriptor())
    }
}

/// A local container engine that images can be loaded into
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Load `tarball` and return the engine's report
    async fn load(&self, tarball: ImageTarball) -> Result<String>;
}

/// Loads images with the `docker load` command
#[derive(Debug, Clone)]
pub struct CliDockerClient {
    executable: PathBuf,
    environment: BTreeMap<String, String>,
}

impl Default for CliDockerClient {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl CliDockerClient {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            environment: BTreeMap::new(),
        }
    }

    /// Extra environment for the command, e.g. `DOCKER_HOST`
    pub fn with_environment(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }
}

/// Stream the archive into the engine's stdin; the tar writer is synchronous
fn write_to_stdin(stdin: Option<SyncIoBridge<ChildStdin>>, tarball: &ImageTarball) -> Result<()> {
    if let Some(mut stdin) = stdin {
        tarball.write_to(&mut stdin)?;
        stdin.flush()?;
    }
    Ok(())
}

#[async_trait]
impl DockerClient for CliDockerClient {
    async fn load(&self, tarball: ImageTarball) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .arg("load")
            .envs(&self.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuilderError::DockerLoad(format!("failed to run {}: {}", self.executable.display(), e)))?;

        let stdin = child.stdin.take().map(SyncIoBridge::new);
        let writer = tokio::task::spawn_blocking(move || write_to_stdin(stdin, &tarball));
        let (written, output) = tokio::join!(writer, child.wait_with_output());

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BuilderError::DockerLoad(if stderr.is_empty() {
                format!("{} load exited with {}", self.executable.display(), output.status)
            } else {
                stderr
            }));
        }
        written??;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::image::blob::BytesBlob;
    use std::io::Read;

    #[tokio::test]
    async fn test_docker_load_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::with_directory(dir.path()).unwrap();
        let layer = cache
            .write_uncompressed_layer(Box::new(BytesBlob::new(&b"layer"[..])), Vec::new())
            .await
            .unwrap();

        let image = Image {
            layers: vec![layer.clone()],
            ..Image::default()
        };
        let reference = ImageReference::parse("app").unwrap();
        let tarball = ImageTarball::new(image, reference, vec!["latest".to_string(), "v1".to_string()]);
        assert_eq!(tarball.repo_tags(), vec!["app:latest", "app:v1"]);

        let mut bytes = Vec::new();
        tarball.write_to(&mut bytes).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            files.insert(name, content);
        }

        let layer_file = format!("{}.tar.gz", layer.digest().hash());
        assert_eq!(files[&layer_file], std::fs::read(layer.path()).unwrap());

        let manifest: serde_json::Value = serde_json::from_slice(&files["manifest.json"]).unwrap();
        assert_eq!(manifest[0]["Config"], "config.json");
        assert_eq!(manifest[0]["RepoTags"][1], "app:v1");
        assert_eq!(manifest[0]["Layers"][0], layer_file.as_str());

        let config: serde_json::Value = serde_json::from_slice(&files["config.json"]).unwrap();
        assert_eq!(config["rootfs"]["diff_ids"][0], layer.diff_id().as_str());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_client_streams_the_tarball_and_reports_failures() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let received = dir.path().join("received.tar");
        // one script for both outcomes: a second process spawned while the file is open
        // for writing could make exec fail with ETXTBSY
        let script = dir.path().join("docker");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ -n \"$FAIL\" ]; then echo \"$FAIL\" >&2; exit 3; fi\ncat > \"$OUT\"\necho \"Loaded image: app:1\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let reference = ImageReference::parse("app:1").unwrap();
        let tarball = ImageTarball::new(Image::default(), reference, vec!["1".to_string()]);

        let client = CliDockerClient::new(&script).with_environment("OUT", received.to_string_lossy());
        let report = client.load(tarball.clone()).await.unwrap();
        assert_eq!(report, "Loaded image: app:1");

        let mut expected = Vec::new();
        tarball.write_to(&mut expected).unwrap();
        assert_eq!(std::fs::read(&received).unwrap(), expected);

        let failing = client.with_environment("FAIL", "daemon not running");
        match failing.load(tarball).await {
            Err(BuilderError::DockerLoad(message)) => assert_eq!(message, "daemon not running"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_repo_tags_keep_custom_registry() {
        let reference = ImageReference::parse("localhost:5000/team/app:1").unwrap();
        let tarball = ImageTarball::new(Image::default(), reference, vec!["1".to_string()]);
        assert_eq!(tarball.repo_tags(), vec!["localhost:5000/team/app:1"]);
    }
}
