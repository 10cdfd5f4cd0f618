//! SHA256 digests and content descriptors
//!
//! Every blob, layer and manifest is identified by a [`Digest`] of the form
//! `sha256:<64 lowercase hex>`. Construction always validates; there is no lenient parse.

use crate::error::{BuilderError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll, ready};
use tokio::io::AsyncWrite;

pub const SHA256_PREFIX: &str = "sha256:";

const HASH_LENGTH: usize = 64;

/// Validated `sha256:` content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// From a bare 64 character lowercase hex hash
    pub fn from_hash(hash: &str) -> Result<Self> {
        if !is_valid_hash(hash) {
            return Err(BuilderError::InvalidDigest(format!(
                "'{}' is not a 64 character lowercase hex hash",
                hash
            )));
        }
        Ok(Digest(format!("{}{}", SHA256_PREFIX, hash)))
    }

    /// From the prefixed `sha256:<hash>` form
    pub fn from_digest(digest: &str) -> Result<Self> {
        match digest.strip_prefix(SHA256_PREFIX) {
            Some(hash) if is_valid_hash(hash) => Ok(Digest(digest.to_string())),
            _ => Err(BuilderError::InvalidDigest(format!(
                "'{}' is not of the form sha256:<64 lowercase hex>",
                digest
            ))),
        }
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Digest(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
    }

    /// The hex part without the algorithm prefix
    pub fn hash(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LENGTH && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::from_digest(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = BuilderError;

    fn try_from(value: String) -> Result<Self> {
        Digest::from_digest(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Digest and size of a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub size: u64,
}

impl BlobDescriptor {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self { digest, size }
    }
}

/// Writer adapter that hashes and counts every byte passed through to `inner`
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    size: u64,
}

impl<W> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.size
    }

    /// Descriptor of everything written so far
    pub fn descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::new(Digest::from_hasher(self.hasher.clone()), self.size)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn finish(self) -> (W, BlobDescriptor) {
        let descriptor = BlobDescriptor::new(Digest::from_hasher(self.hasher), self.size);
        (self.inner, descriptor)
    }

    fn record(&mut self, written: &[u8]) {
        self.hasher.update(written);
        self.size += written.len() as u64;
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.record(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DigestWriter<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.record(&buf[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Consume `reader` to the end, copying it into `sink`, and describe what was read
///
/// The size is counted rather than taken from any length hint, so streams of unknown length
/// are described correctly.
pub fn compute_digest<R: Read + ?Sized, W: Write + ?Sized>(reader: &mut R, sink: &mut W) -> Result<BlobDescriptor> {
    let mut writer = DigestWriter::new(sink);
    io::copy(reader, &mut writer)?;
    writer.flush()?;
    Ok(writer.descriptor())
}
