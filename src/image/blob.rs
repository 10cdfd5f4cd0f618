//! Blob sources that can be written out while being digested

use crate::error::Result;
use crate::image::digest::{BlobDescriptor, DigestWriter, compute_digest};
use bytes::Bytes;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// Content that can be serialized to a byte sink
///
/// Writing is synchronous; async callers run it on the blocking pool.
pub trait Blob: Send + Sync {
    /// Write the full content to `out` and describe what was written
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor>;
}

/// In-memory blob
#[derive(Debug, Clone)]
pub struct BytesBlob(Bytes);

impl BytesBlob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Serialized JSON of `value`, the form manifests and container configurations are pushed in
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }
}

impl Blob for BytesBlob {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut writer = DigestWriter::new(out);
        writer.write_all(&self.0)?;
        writer.flush()?;
        Ok(writer.descriptor())
    }
}

/// Blob backed by a file on disk
#[derive(Debug, Clone)]
pub struct FileBlob {
    path: PathBuf,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Blob for FileBlob {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        compute_digest(&mut reader, out)
    }
}
