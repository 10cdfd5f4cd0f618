//! Fingerprints of application layer entries
//!
//! A layer built from local files is looked up by a digest over its ordered entries. Each
//! entry contributes its source path, extraction path, permissions, modification time and,
//! for regular files, a hash of the file content. Changing any of these yields a different
//! selector.

use crate::error::Result;
use crate::image::digest::{Digest, compute_digest};
use crate::image::layer::LayerEntry;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryFingerprint<'a> {
    source_path: String,
    extraction_path: &'a str,
    permissions: String,
    modification_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Digest>,
}

/// Digest identifying `entries` in their given order
pub fn fingerprint(entries: &[LayerEntry]) -> Result<Digest> {
    let mut fingerprints = Vec::with_capacity(entries.len());
    for entry in entries {
        let content = if entry.source_path().is_file() {
            let mut reader = BufReader::new(File::open(entry.source_path())?);
            Some(compute_digest(&mut reader, &mut io::sink())?.digest)
        } else {
            None
        };
        fingerprints.push(EntryFingerprint {
            source_path: entry.source_path().to_string_lossy().into_owned(),
            extraction_path: entry.extraction_path(),
            permissions: format!("{:o}", entry.permissions()),
            modification_time: entry.modification_time().to_rfc3339(),
            content,
        });
    }
    Ok(Digest::of_bytes(&serde_json::to_vec(&fingerprints)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_fingerprint_tracks_metadata_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.txt");
        std::fs::write(&file, b"hello").unwrap();

        let entry = LayerEntry::with_defaults(&file, "/app/app.txt").unwrap();
        let original = fingerprint(std::slice::from_ref(&entry)).unwrap();
        assert_eq!(original, fingerprint(std::slice::from_ref(&entry)).unwrap());

        let touched = LayerEntry::new(
            &file,
            "/app/app.txt",
            entry.permissions(),
            Utc.timestamp_opt(1_000, 0).unwrap(),
        )
        .unwrap();
        assert_ne!(original, fingerprint(&[touched]).unwrap());

        let moved = LayerEntry::with_defaults(&file, "/srv/app.txt").unwrap();
        assert_ne!(original, fingerprint(&[moved]).unwrap());

        std::fs::write(&file, b"HELLO").unwrap();
        assert_ne!(original, fingerprint(&[entry]).unwrap());
    }

    #[test]
    fn test_order_matters() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();
        let a = LayerEntry::with_defaults(&a, "/a").unwrap();
        let b = LayerEntry::with_defaults(&b, "/b").unwrap();
        assert_ne!(
            fingerprint(&[a.clone(), b.clone()]).unwrap(),
            fingerprint(&[b, a]).unwrap()
        );
    }
}
