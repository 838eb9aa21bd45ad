//! Filesystem layout for archive blobs and their metadata sidecars.
//!
//! ```text
//! <root>/<source_table>/<snapshot_date>/<filter>.parquet
//! <root>/<source_table>/<snapshot_date>/<filter>.json
//! <root>/<source_table>/<snapshot_date>/<filter>.claim
//! ```
//!
//! The `.claim` marker is created with `create_new` before anything else is
//! written, so only one writer ever owns a slot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ArchiveEntry;
use crate::error::Result;

const BLOB_EXT: &str = "parquet";
const META_EXT: &str = "json";
const CLAIM_EXT: &str = "claim";

/// Directory-backed archive storage.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
}

fn path_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob path relative to the root for one archive slot.
    pub fn blob_location(&self, source_table: &str, snapshot_date: &str, filter: Option<&str>) -> String {
        format!(
            "{}/{}/{}.{}",
            path_segment(source_table),
            snapshot_date,
            filter.map(path_segment).unwrap_or_else(|| "all".to_string()),
            BLOB_EXT
        )
    }

    fn resolve(&self, location: &str) -> PathBuf {
        self.root.join(location)
    }

    fn sidecar(&self, location: &str) -> PathBuf {
        self.resolve(location).with_extension(META_EXT)
    }

    fn claim_marker(&self, location: &str) -> PathBuf {
        self.resolve(location).with_extension(CLAIM_EXT)
    }

    /// Reserve a slot. Returns false when another archive already owns it.
    pub fn claim(&self, location: &str) -> Result<bool> {
        if self.sidecar(location).exists() || self.resolve(location).exists() {
            return Ok(false);
        }
        let marker = self.claim_marker(location);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Give up a claimed slot whose archive was never written.
    pub fn release(&self, location: &str) -> Result<()> {
        remove_if_present(&self.claim_marker(location))
    }

    /// Write through a temporary file and rename into place.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Store the blob first, then the sidecar that makes it visible.
    pub fn put(&self, entry: &ArchiveEntry, blob: &[u8]) -> Result<()> {
        Self::write_atomic(&self.resolve(&entry.blob_location), blob)?;
        let meta = serde_json::to_vec_pretty(entry)?;
        Self::write_atomic(&self.sidecar(&entry.blob_location), &meta)?;
        debug!("stored archive {} at {}", entry.archive_id, entry.blob_location);
        Ok(())
    }

    /// Blob bytes, or `None` when the blob is missing.
    pub fn read_blob(&self, location: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(location)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove blob, sidecar and claim. Missing files are ignored.
    pub fn delete(&self, location: &str) -> Result<()> {
        for path in [
            self.resolve(location),
            self.sidecar(location),
            self.claim_marker(location),
        ] {
            remove_if_present(&path)?;
        }
        Ok(())
    }

    /// All entries found under the root.
    pub fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        if self.root.exists() {
            self.collect(&self.root, &mut entries)?;
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    fn collect(&self, dir: &Path, out: &mut Vec<ArchiveEntry>) -> Result<()> {
        for item in fs::read_dir(dir)? {
            let path = item?.path();
            if path.is_dir() {
                self.collect(&path, out)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some(META_EXT) {
                let content = fs::read(&path)?;
                out.push(serde_json::from_slice(&content)?);
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_location_is_path_safe() {
        let store = FsArchiveStore::new("/tmp/archives");
        assert_eq!(
            store.blob_location("Orders", "2024-05-01", Some("Acme Co/EU")),
            "orders/2024-05-01/acme_co_eu.parquet"
        );
        assert_eq!(
            store.blob_location("orders", "2024-05-01", None),
            "orders/2024-05-01/all.parquet"
        );
    }

    #[test]
    fn test_missing_blob_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path());
        assert!(store.read_blob("orders/x/all.parquet").unwrap().is_none());
        assert!(store.entries().unwrap().is_empty());
        store.delete("orders/x/all.parquet").unwrap();
    }

    #[test]
    fn test_slot_is_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArchiveStore::new(dir.path());
        let location = store.blob_location("orders", "2024-05-01", None);

        assert!(store.claim(&location).unwrap());
        assert!(!store.claim(&location).unwrap());

        store.release(&location).unwrap();
        assert!(store.claim(&location).unwrap());
    }
}
