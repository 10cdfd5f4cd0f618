//! Layer entries and the reproducible layer tarball builder

use crate::error::{BuilderError, Result};
use crate::image::blob::Blob;
use crate::image::digest::{BlobDescriptor, DigestWriter};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};

pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
pub const DEFAULT_DIRECTORY_PERMISSIONS: u32 = 0o755;

/// Modification time given to entries that do not set one, and to implicit directories
pub fn default_modification_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1, 0).single().unwrap_or_default()
}

/// One file or directory placed into a layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerEntry {
    source_path: PathBuf,
    extraction_path: String,
    permissions: u32,
    modification_time: DateTime<Utc>,
}

impl LayerEntry {
    /// `extraction_path` must be an absolute path inside the container
    pub fn new(
        source_path: impl Into<PathBuf>,
        extraction_path: &str,
        permissions: u32,
        modification_time: DateTime<Utc>,
    ) -> Result<Self> {
        if !extraction_path.starts_with('/') {
            return Err(BuilderError::InvalidConfiguration(format!(
                "extraction path '{}' is not absolute",
                extraction_path
            )));
        }
        let normalized = extraction_path
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>();
        if normalized.contains(&"..") {
            return Err(BuilderError::InvalidConfiguration(format!(
                "extraction path '{}' escapes the container root",
                extraction_path
            )));
        }
        Ok(Self {
            source_path: source_path.into(),
            extraction_path: format!("/{}", normalized.join("/")),
            permissions: permissions & 0o7777,
            modification_time,
        })
    }

    /// Entry with default permissions for its file type and the default modification time
    pub fn with_defaults(source_path: impl Into<PathBuf>, extraction_path: &str) -> Result<Self> {
        let source_path = source_path.into();
        let permissions = if source_path.is_dir() {
            DEFAULT_DIRECTORY_PERMISSIONS
        } else {
            DEFAULT_FILE_PERMISSIONS
        };
        Self::new(source_path, extraction_path, permissions, default_modification_time())
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn extraction_path(&self) -> &str {
        &self.extraction_path
    }

    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    pub fn modification_time(&self) -> DateTime<Utc> {
        self.modification_time
    }
}

/// Named, ordered list of entries making up one application layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerConfiguration {
    name: String,
    entries: Vec<LayerEntry>,
}

impl LayerConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn add_entry(mut self, entry: LayerEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add `source` and, when it is a directory, everything below it
    ///
    /// Children are added in name order so the entry list does not depend on directory
    /// iteration order.
    pub fn add_entry_recursive(mut self, source: impl AsRef<Path>, extraction_path: &str) -> Result<Self> {
        self.push_recursive(source.as_ref(), extraction_path)?;
        Ok(self)
    }

    fn push_recursive(&mut self, source: &Path, extraction_path: &str) -> Result<()> {
        let entry = LayerEntry::with_defaults(source, extraction_path)?;
        let extraction_path = entry.extraction_path.clone();
        self.entries.push(entry);

        if source.is_dir() {
            let mut children = fs::read_dir(source)?
                .map(|child| child.map(|child| child.path()))
                .collect::<io::Result<Vec<_>>>()?;
            children.sort();
            for child in children {
                let Some(name) = child.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                let child_extraction = format!("{}/{}", extraction_path.trim_end_matches('/'), name);
                self.push_recursive(&child, &child_extraction)?;
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[LayerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds a layer tarball whose bytes depend only on the entries
///
/// Entries are written sorted by extraction path with missing parent directories added,
/// owned by root, with their configured permissions and modification times. A path that
/// appears twice keeps its first entry.
#[derive(Debug, Clone)]
pub struct ReproducibleLayerBuilder {
    entries: Vec<LayerEntry>,
}

impl ReproducibleLayerBuilder {
    pub fn new(entries: &[LayerEntry]) -> Self {
        Self {
            entries: entries.to_vec(),
        }
    }

    fn write_archive<W: Write>(&self, archive: &mut tar::Builder<W>) -> Result<()> {
        let mut sorted: Vec<&LayerEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.extraction_path.cmp(&b.extraction_path));

        let mut written: BTreeSet<String> = BTreeSet::new();
        for entry in sorted {
            if entry.extraction_path == "/" || written.contains(&entry.extraction_path) {
                continue;
            }

            let mut parent = String::new();
            let components: Vec<&str> = entry.extraction_path[1..].split('/').collect();
            for component in &components[..components.len() - 1] {
                parent.push('/');
                parent.push_str(component);
                if written.insert(parent.clone()) {
                    let mut header = tar_header(
                        EntryType::Directory,
                        DEFAULT_DIRECTORY_PERMISSIONS,
                        default_modification_time(),
                        0,
                    );
                    archive.append_data(&mut header, format!("{}/", &parent[1..]), io::empty())?;
                }
            }

            written.insert(entry.extraction_path.clone());
            let path = &entry.extraction_path[1..];
            let metadata = fs::metadata(&entry.source_path)?;
            if metadata.is_dir() {
                let mut header = tar_header(EntryType::Directory, entry.permissions, entry.modification_time, 0);
                archive.append_data(&mut header, format!("{}/", path), io::empty())?;
            } else {
                let mut header = tar_header(
                    EntryType::Regular,
                    entry.permissions,
                    entry.modification_time,
                    metadata.len(),
                );
                archive.append_data(&mut header, path, File::open(&entry.source_path)?)?;
            }
        }
        Ok(())
    }
}

fn tar_header(kind: EntryType, mode: u32, modification_time: DateTime<Utc>, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_mtime(modification_time.timestamp().max(0) as u64);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(size);
    header
}

impl Blob for ReproducibleLayerBuilder {
    fn write_to(&self, out: &mut dyn Write) -> Result<BlobDescriptor> {
        let mut writer = DigestWriter::new(out);
        let mut archive = tar::Builder::new(&mut writer);
        self.write_archive(&mut archive)?;
        archive.into_inner()?;
        writer.flush()?;
        Ok(writer.descriptor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_names(tarball: &[u8]) -> Vec<(String, u32, u64)> {
        let mut archive = tar::Archive::new(tarball);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let header = entry.header();
                (
                    entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    header.mode().unwrap(),
                    header.mtime().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_rejects_relative_extraction_path() {
        assert!(LayerEntry::with_defaults("/tmp", "app/file").is_err());
        assert!(LayerEntry::with_defaults("/tmp", "/app/../../etc").is_err());
        let entry = LayerEntry::with_defaults("/nonexistent", "/app//./file").unwrap();
        assert_eq!(entry.extraction_path(), "/app/file");
    }

    #[test]
    fn test_layer_is_sorted_with_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"bb").unwrap();

        let mtime = Utc.timestamp_opt(1_000, 0).unwrap();
        let entries = vec![
            LayerEntry::new(&b, "/app/lib/b.txt", 0o600, mtime).unwrap(),
            LayerEntry::new(&a, "/app/a.txt", 0o755, mtime).unwrap(),
        ];
        let mut tarball = Vec::new();
        ReproducibleLayerBuilder::new(&entries).write_to(&mut tarball).unwrap();

        assert_eq!(
            entry_names(&tarball),
            vec![
                ("app".to_string(), 0o755, 1),
                ("app/a.txt".to_string(), 0o755, 1_000),
                ("app/lib".to_string(), 0o755, 1),
                ("app/lib/b.txt".to_string(), 0o600, 1_000),
            ]
        );
    }

    #[test]
    fn test_same_entries_same_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"content").unwrap();
        let config = LayerConfiguration::new("app")
            .add_entry_recursive(dir.path(), "/srv")
            .unwrap();
        assert_eq!(config.entries().len(), 2);

        let first = ReproducibleLayerBuilder::new(config.entries())
            .write_to(&mut io::sink())
            .unwrap();
        let second = ReproducibleLayerBuilder::new(config.entries())
            .write_to(&mut io::sink())
            .unwrap();
        assert_eq!(first, second);

        let touched = vec![LayerEntry::new(
            dir.path().join("f"),
            "/srv/f",
            DEFAULT_FILE_PERMISSIONS,
            Utc.timestamp_opt(2, 0).unwrap(),
        )
        .unwrap()];
        let third = ReproducibleLayerBuilder::new(&touched).write_to(&mut io::sink()).unwrap();
        assert_ne!(first.digest, third.digest);
    }
}
