//! Content-addressable layer cache
//!
//! Base image layers are stored under their registry digest; application layers are stored
//! the same way and additionally indexed by a fingerprint of the entries they were built
//! from. The cache also remembers the last pulled manifest and container configuration of
//! each base image so that builds can run offline.
//!
//! A damaged entry is reported as [`BuilderError::CacheCorrupted`], never as a miss.

pub mod selector;
pub mod storage;

use crate::error::{BuilderError, Result};
use crate::image::blob::{Blob, FileBlob};
use crate::image::container_config::ContainerConfigurationTemplate;
use crate::image::digest::{BlobDescriptor, Digest, DigestWriter};
use crate::image::layer::LayerEntry;
use crate::image::manifest::ManifestTemplate;
use crate::image::reference::ImageReference;
use crate::registry::transport::RequestBody;
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use storage::{CacheStorageFiles, read_optional};
use tokio::io::AsyncWrite;
use tracing::debug;

/// A layer stored in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
    digest: Digest,
    diff_id: Digest,
    size: u64,
    path: PathBuf,
}

impl CachedLayer {
    /// Digest of the compressed blob
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Digest of the uncompressed tarball
    pub fn diff_id(&self) -> &Digest {
        &self.diff_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blob_descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::new(self.digest.clone(), self.size)
    }

    pub fn blob(&self) -> FileBlob {
        FileBlob::new(&self.path)
    }

    pub fn request_body(&self) -> RequestBody {
        RequestBody::File {
            path: self.path.clone(),
            size: self.size,
        }
    }
}

/// Last pulled manifest of an image, with its container configuration for schema 2
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub manifest: ManifestTemplate,
    pub manifest_digest: Digest,
    pub container_configuration: Option<ContainerConfigurationTemplate>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageMetadataTemplate {
    manifest_digest: Digest,
    manifest_media_type: String,
    manifest: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container_configuration: Option<ContainerConfigurationTemplate>,
}

/// Handle on one cache directory; cheap to clone
#[derive(Debug, Clone)]
pub struct Cache {
    files: CacheStorageFiles,
}

impl Cache {
    pub fn with_directory(cache_directory: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            files: CacheStorageFiles::open(cache_directory.as_ref())?,
        })
    }

    pub fn directory(&self) -> &Path {
        self.files.cache_directory()
    }

    /// Look up a layer by its compressed digest
    pub fn retrieve_by_digest(&self, digest: &Digest) -> Result<Option<CachedLayer>> {
        let directory = self.files.layer_directory(digest);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BuilderError::corrupted(&directory, e.to_string())),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BuilderError::corrupted(&directory, e.to_string()))?;
            files.push(entry);
        }
        let [entry] = files.as_slice() else {
            return Err(BuilderError::corrupted(
                &directory,
                format!("expected exactly one layer file, found {}", files.len()),
            ));
        };

        let name = entry.file_name();
        let diff_id = name
            .to_str()
            .and_then(|name| Digest::from_hash(name).ok())
            .ok_or_else(|| BuilderError::corrupted(entry.path(), "layer file is not named by its diff id"))?;
        let metadata = entry
            .metadata()
            .map_err(|e| BuilderError::corrupted(entry.path(), e.to_string()))?;
        if !metadata.is_file() {
            return Err(BuilderError::corrupted(entry.path(), "layer entry is not a file"));
        }

        Ok(Some(CachedLayer {
            digest: digest.clone(),
            diff_id,
            size: metadata.len(),
            path: entry.path(),
        }))
    }

    /// Look up an application layer by the entries it was built from
    ///
    /// A selector pointing at a layer that is no longer present counts as a miss.
    pub fn retrieve_by_entries(&self, entries: &[LayerEntry]) -> Result<Option<CachedLayer>> {
        let selector = self.files.selector_file(&selector::fingerprint(entries)?);
        let Some(content) = read_optional(&selector)? else {
            return Ok(None);
        };
        let digest = std::str::from_utf8(&content)
            .ok()
            .and_then(|content| Digest::from_digest(content.trim()).ok())
            .ok_or_else(|| BuilderError::corrupted(&selector, "selector does not hold a layer digest"))?;
        self.retrieve_by_digest(&digest)
    }

    /// Store a compressed blob produced by `write`, typically a registry download
    ///
    /// Bytes written through the [`DiffIdWriter`] are decompressed as they arrive, so the
    /// diff id is known as soon as the download ends. If `write` fails, nothing is left
    /// behind in the cache.
    pub async fn write_compressed_layer<F, Fut>(&self, write: F) -> Result<CachedLayer>
    where
        F: FnOnce(DiffIdWriter<tokio::fs::File>) -> Fut,
        Fut: Future<Output = Result<BlobDescriptor>>,
    {
        let staged = self.files.temporary_path();
        fs::create_dir_all(&staged)?;
        let blob_path = staged.join("blob");

        let file = tokio::fs::File::create(&blob_path).await?;
        let (writer, decoded) = DiffIdWriter::new(file);
        let written = write(writer).await.and_then(|descriptor| Ok((descriptor, decoded.finish()?)));
        let (descriptor, diff_id) = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_dir_all(&staged);
                return Err(e);
            }
        };

        let files = self.files.clone();
        tokio::task::spawn_blocking(move || {
            let result = install_compressed(&files, &staged, &blob_path, descriptor, diff_id);
            if result.is_err() {
                let _ = fs::remove_dir_all(&staged);
            }
            result
        })
        .await?
    }

    /// Compress `blob` into the cache and index it under the fingerprint of `entries`
    pub async fn write_uncompressed_layer(
        &self,
        blob: Box<dyn Blob>,
        entries: Vec<LayerEntry>,
    ) -> Result<CachedLayer> {
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || {
            let staged = files.temporary_path();
            fs::create_dir_all(&staged)?;
            let result = install_uncompressed(&files, &staged, blob.as_ref(), &entries);
            if result.is_err() {
                let _ = fs::remove_dir_all(&staged);
            }
            result
        })
        .await?
    }

    /// Remember the manifest, and container configuration if any, last pulled for `image`
    pub fn write_metadata(
        &self,
        image: &ImageReference,
        manifest: &ManifestTemplate,
        manifest_digest: &Digest,
        container_configuration: Option<&ContainerConfigurationTemplate>,
    ) -> Result<()> {
        let template = ImageMetadataTemplate {
            manifest_digest: manifest_digest.clone(),
            manifest_media_type: manifest.media_type().to_string(),
            manifest: serde_json::from_slice(&manifest.to_json()?)?,
            container_configuration: container_configuration.cloned(),
        };
        let path = self.files.metadata_file(image);
        self.files.write_atomically(&path, &serde_json::to_vec_pretty(&template)?)?;
        debug!("Cached metadata for {} at {}", image, path.display());
        Ok(())
    }

    pub fn retrieve_metadata(&self, image: &ImageReference) -> Result<Option<ImageMetadata>> {
        let path = self.files.metadata_file(image);
        let Some(content) = read_optional(&path)? else {
            return Ok(None);
        };
        let template: ImageMetadataTemplate =
            serde_json::from_slice(&content).map_err(|e| BuilderError::corrupted(&path, e.to_string()))?;
        let manifest_json = serde_json::to_vec(&template.manifest)?;
        let manifest = ManifestTemplate::from_json(&manifest_json, Some(&template.manifest_media_type))
            .map_err(|e| BuilderError::corrupted(&path, e.to_string()))?;
        Ok(Some(ImageMetadata {
            manifest,
            manifest_digest: template.manifest_digest,
            container_configuration: template.container_configuration,
        }))
    }

}

struct DecodeState {
    decoder: Option<GzDecoder<DigestWriter<io::Sink>>>,
    error: Option<io::Error>,
}

/// Writer handed to [`Cache::write_compressed_layer`]
///
/// Passes compressed bytes through to the staged file and feeds them to a gzip decoder
/// whose output is hashed into the diff id.
pub struct DiffIdWriter<W> {
    inner: W,
    state: Arc<Mutex<DecodeState>>,
}

/// The diff id side of a [`DiffIdWriter`], read once writing is done
struct DecodedDiffId(Arc<Mutex<DecodeState>>);

impl<W> DiffIdWriter<W> {
    fn new(inner: W) -> (Self, DecodedDiffId) {
        let state = Arc::new(Mutex::new(DecodeState {
            decoder: Some(GzDecoder::new(DigestWriter::new(io::sink()))),
            error: None,
        }));
        (
            Self {
                inner,
                state: state.clone(),
            },
            DecodedDiffId(state),
        )
    }

    fn decode(&self, compressed: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.error.is_some() {
            return;
        }
        if let Some(decoder) = state.decoder.as_mut() {
            if let Err(e) = decoder.write_all(compressed) {
                state.error = Some(e);
            }
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DiffIdWriter<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        self.decode(&buf[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl DecodedDiffId {
    fn finish(self) -> Result<Digest> {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(e) = state.error.take() {
            return Err(BuilderError::Io(format!("layer is not a gzip stream: {}", e)));
        }
        let decoder = state
            .decoder
            .take()
            .ok_or_else(|| BuilderError::Io("layer diff id was already read".to_string()))?;
        let hashed = decoder
            .finish()
            .map_err(|e| BuilderError::Io(format!("layer is not a gzip stream: {}", e)))?;
        Ok(hashed.descriptor().digest)
    }
}

fn installed(files: &CacheStorageFiles, descriptor: &BlobDescriptor, diff_id: Digest) -> CachedLayer {
    CachedLayer {
        path: files.layer_file(&descriptor.digest, &diff_id),
        digest: descriptor.digest.clone(),
        diff_id,
        size: descriptor.size,
    }
}

fn install_compressed(
    files: &CacheStorageFiles,
    staged: &Path,
    blob_path: &Path,
    descriptor: BlobDescriptor,
    diff_id: Digest,
) -> Result<CachedLayer> {
    fs::rename(blob_path, staged.join(diff_id.hash()))?;

    if !files.install_layer_directory(staged, &descriptor.digest)? {
        debug!("Layer {} was already cached", descriptor.digest);
    }
    Ok(installed(files, &descriptor, diff_id))
}

fn install_uncompressed(
    files: &CacheStorageFiles,
    staged: &Path,
    blob: &dyn Blob,
    entries: &[LayerEntry],
) -> Result<CachedLayer> {
    let blob_path = staged.join("blob");
    let mut compressed = DigestWriter::new(BufWriter::new(File::create(&blob_path)?));
    let mut encoder = GzEncoder::new(&mut compressed, Compression::default());
    let diff_id = blob.write_to(&mut encoder)?.digest;
    encoder.finish()?;
    compressed.flush()?;
    let descriptor = compressed.descriptor();
    drop(compressed);
    fs::rename(&blob_path, staged.join(diff_id.hash()))?;

    if !files.install_layer_directory(staged, &descriptor.digest)? {
        debug!("Layer {} was already cached", descriptor.digest);
    }

    let selector = files.selector_file(&selector::fingerprint(entries)?);
    files.write_atomically(&selector, descriptor.digest.as_str().as_bytes())?;
    Ok(installed(files, &descriptor, diff_id))
}
