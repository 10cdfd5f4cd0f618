//! On-disk layout of a cache directory
//!
//! ```text
//! <cache>/
//!   layers/<layer digest hash>/<diff id hash>   compressed layer blob
//!   selectors/<fingerprint hash>                 layer digest of an application layer
//!   images/<registry>/<repository>/<qualifier>/metadata.json
//!   tmp/                                         staging area, renamed into place
//! ```
//!
//! Everything is written under `tmp/` first and renamed into place, so readers only ever
//! see complete entries. Concurrent writers of the same layer produce identical content;
//! the first rename wins and later writers reuse its result.

use crate::error::{BuilderError, Result};
use crate::image::digest::Digest;
use crate::image::reference::ImageReference;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const LAYERS_DIRECTORY: &str = "layers";
const SELECTORS_DIRECTORY: &str = "selectors";
const IMAGES_DIRECTORY: &str = "images";
const TEMPORARY_DIRECTORY: &str = "tmp";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone)]
pub struct CacheStorageFiles {
    cache_directory: PathBuf,
}

impl CacheStorageFiles {
    /// Create the directory skeleton if needed
    pub fn open(cache_directory: &Path) -> Result<Self> {
        for directory in [LAYERS_DIRECTORY, SELECTORS_DIRECTORY, IMAGES_DIRECTORY, TEMPORARY_DIRECTORY] {
            let path = cache_directory.join(directory);
            fs::create_dir_all(&path).map_err(|e| BuilderError::CacheDirectoryCreation {
                path: path.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(Self {
            cache_directory: cache_directory.to_path_buf(),
        })
    }

    pub fn cache_directory(&self) -> &Path {
        &self.cache_directory
    }

    pub fn layer_directory(&self, layer_digest: &Digest) -> PathBuf {
        self.cache_directory.join(LAYERS_DIRECTORY).join(layer_digest.hash())
    }

    pub fn layer_file(&self, layer_digest: &Digest, diff_id: &Digest) -> PathBuf {
        self.layer_directory(layer_digest).join(diff_id.hash())
    }

    pub fn selector_file(&self, fingerprint: &Digest) -> PathBuf {
        self.cache_directory.join(SELECTORS_DIRECTORY).join(fingerprint.hash())
    }

    pub fn metadata_file(&self, image: &ImageReference) -> PathBuf {
        let mut path = self.cache_directory.join(IMAGES_DIRECTORY).join(sanitize(image.registry()));
        for component in image.repository().split('/') {
            path.push(sanitize(component));
        }
        path.push(sanitize(&image.qualifier()));
        path.join(METADATA_FILE)
    }

    /// Fresh, uniquely named path under `tmp/`
    pub fn temporary_path(&self) -> PathBuf {
        self.cache_directory
            .join(TEMPORARY_DIRECTORY)
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Move a staged layer directory into place
    ///
    /// Returns `false` when another writer installed the same layer first; the staged copy
    /// is removed in that case.
    pub fn install_layer_directory(&self, staged: &Path, layer_digest: &Digest) -> Result<bool> {
        let target = self.layer_directory(layer_digest);
        if target.exists() {
            fs::remove_dir_all(staged)?;
            return Ok(false);
        }
        match fs::rename(staged, &target) {
            Ok(()) => Ok(true),
            Err(_) if target.exists() => {
                fs::remove_dir_all(staged)?;
                Ok(false)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(staged);
                Err(e.into())
            }
        }
    }

    /// Replace `target` with `content` atomically
    pub fn write_atomically(&self, target: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = self.temporary_path();
        fs::write(&staged, content)?;
        if let Err(e) = fs::rename(&staged, target) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Keep path components free of characters some filesystems reject
fn sanitize(component: &str) -> String {
    component.replace([':', '@'], "_")
}

/// Read a file that may legitimately be absent
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuilderError::corrupted(path, e.to_string())),
    }
}
