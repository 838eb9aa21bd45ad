//! Long-term snapshot archives.
//!
//! Each archive is a ZSTD-compressed Parquet copy of a full source rowset with
//! a JSON sidecar describing it. There is at most one archive per
//! `(snapshot_date, customer_filter, source_table)`.

mod codec;
mod store;

pub use codec::{blob_checksum, payload_checksum, schema_hash, ColumnKind};
pub use store::FsArchiveStore;

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ArchiveConfig;
use crate::error::{Result, SyncError};
use crate::record::SourceRecord;

/// Metadata of one stored archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub archive_id: Uuid,
    pub snapshot_date: NaiveDate,
    /// `None` when the archive covers every customer.
    pub customer_filter: Option<String>,
    pub source_table: String,
    /// Blob path relative to the archive root.
    pub blob_location: String,
    pub blob_checksum: String,
    pub payload_checksum: String,
    pub schema_hash: String,
    pub records_count: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub created_at: DateTime<Utc>,
    pub retention_until: DateTime<Utc>,
}

impl ArchiveEntry {
    fn filter_label(&self) -> String {
        self.customer_filter.clone().unwrap_or_else(|| "*".to_string())
    }
}

/// Outcome of checking one archive.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub archive_id: Uuid,
    pub blob_location: String,
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Writes, checks, restores and prunes archives for one source table.
#[derive(Debug, Clone)]
pub struct Archiver {
    store: FsArchiveStore,
    source_table: String,
    retention_days: u32,
}

impl Archiver {
    pub fn new(store: FsArchiveStore, source_table: impl Into<String>, retention_days: u32) -> Self {
        Self {
            store,
            source_table: source_table.into(),
            retention_days,
        }
    }

    pub fn from_config(config: &ArchiveConfig, source_table: impl Into<String>) -> Self {
        Self::new(
            FsArchiveStore::new(config.root.clone()),
            source_table,
            config.retention_days,
        )
    }

    pub fn store(&self) -> &FsArchiveStore {
        &self.store
    }

    /// Archive a rowset as of now.
    pub fn archive(&self, records: &[SourceRecord], customer_filter: Option<&str>) -> Result<ArchiveEntry> {
        self.archive_at(records, customer_filter, Utc::now())
    }

    pub fn archive_at(
        &self,
        records: &[SourceRecord],
        customer_filter: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ArchiveEntry> {
        let filter = customer_filter
            .map(|f| f.trim().to_uppercase())
            .filter(|f| !f.is_empty());
        let snapshot_date = now.date_naive();
        let location = self.store.blob_location(
            &self.source_table,
            &snapshot_date.format("%Y-%m-%d").to_string(),
            filter.as_deref(),
        );
        if !self.store.claim(&location)? {
            return Err(SyncError::ArchiveExists {
                snapshot_date,
                customer_filter: filter.unwrap_or_else(|| "*".to_string()),
                source_table: self.source_table.clone(),
            });
        }

        match self.write_claimed(records, filter, snapshot_date, &location, now) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                self.store.release(&location)?;
                Err(e)
            }
        }
    }

    fn write_claimed(
        &self,
        records: &[SourceRecord],
        filter: Option<String>,
        snapshot_date: NaiveDate,
        location: &str,
        now: DateTime<Utc>,
    ) -> Result<ArchiveEntry> {
        let encoded = codec::encode(records)?;
        let compressed_size = encoded.bytes.len() as u64;
        let entry = ArchiveEntry {
            archive_id: Uuid::new_v4(),
            snapshot_date,
            customer_filter: filter,
            source_table: self.source_table.clone(),
            blob_location: location.to_string(),
            blob_checksum: blob_checksum(&encoded.bytes),
            payload_checksum: payload_checksum(records),
            schema_hash: schema_hash(&encoded.columns),
            records_count: encoded.rows as u64,
            uncompressed_size: encoded.uncompressed_size,
            compressed_size,
            compression_ratio: if compressed_size == 0 {
                0.0
            } else {
                encoded.uncompressed_size as f64 / compressed_size as f64
            },
            created_at: now,
            retention_until: now + Duration::days(self.retention_days.into()),
        };
        self.store.put(&entry, &encoded.bytes)?;

        info!(
            "Archived {} rows of {} (filter {}) to {}: {} bytes, ratio {:.2}",
            entry.records_count,
            entry.source_table,
            entry.filter_label(),
            entry.blob_location,
            entry.compressed_size,
            entry.compression_ratio
        );
        Ok(entry)
    }

    /// All archives, oldest first.
    pub fn list(&self) -> Result<Vec<ArchiveEntry>> {
        self.store.entries()
    }

    fn find(&self, archive_id: Uuid) -> Result<ArchiveEntry> {
        self.list()?
            .into_iter()
            .find(|e| e.archive_id == archive_id)
            .ok_or_else(|| SyncError::Archive(format!("archive {} not found", archive_id)))
    }

    /// Check one archive, or all of them.
    pub fn validate(&self, archive_id: Option<Uuid>) -> Result<Vec<ValidationResult>> {
        let entries = match archive_id {
            Some(id) => vec![self.find(id)?],
            None => self.list()?,
        };

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            let errors = self.check(entry)?;
            if !errors.is_empty() {
                warn!("Archive {} failed validation: {}", entry.archive_id, errors.join("; "));
            }
            results.push(ValidationResult {
                archive_id: entry.archive_id,
                blob_location: entry.blob_location.clone(),
                is_valid: errors.is_empty(),
                errors,
            });
        }
        Ok(results)
    }

    fn check(&self, entry: &ArchiveEntry) -> Result<Vec<String>> {
        let Some(blob) = self.store.read_blob(&entry.blob_location)? else {
            return Ok(vec!["blob is missing".to_string()]);
        };

        let mut errors = Vec::new();
        if blob.len() as u64 != entry.compressed_size {
            errors.push(format!(
                "size mismatch: expected {} bytes, found {}",
                entry.compressed_size,
                blob.len()
            ));
        }
        if blob_checksum(&blob) != entry.blob_checksum {
            errors.push("blob checksum mismatch".to_string());
        }

        match codec::decode(Bytes::from(blob)) {
            Ok(records) => {
                if records.len() as u64 != entry.records_count {
                    errors.push(format!(
                        "record count mismatch: expected {}, decoded {}",
                        entry.records_count,
                        records.len()
                    ));
                }
                if payload_checksum(&records) != entry.payload_checksum {
                    errors.push("payload checksum mismatch".to_string());
                }
            }
            Err(e) => errors.push(format!("payload does not decode: {}", e)),
        }
        Ok(errors)
    }

    /// Decode an archive back to its records after checking it.
    pub fn restore(&self, archive_id: Uuid) -> Result<Vec<SourceRecord>> {
        let entry = self.find(archive_id)?;
        let blob = self
            .store
            .read_blob(&entry.blob_location)?
            .ok_or_else(|| SyncError::Archive(format!("blob {} is missing", entry.blob_location)))?;
        if blob_checksum(&blob) != entry.blob_checksum {
            return Err(SyncError::Archive(format!(
                "blob {} does not match its checksum",
                entry.blob_location
            )));
        }

        let records = codec::decode(Bytes::from(blob))?;
        if payload_checksum(&records) != entry.payload_checksum {
            return Err(SyncError::Archive(format!(
                "archive {} payload does not match its checksum",
                archive_id
            )));
        }
        info!("Restored {} rows from archive {}", records.len(), archive_id);
        Ok(records)
    }

    /// Remove archives older than `keep_days` or past their retention date.
    pub fn cleanup(&self, keep_days: u32, dry_run: bool) -> Result<Vec<ArchiveEntry>> {
        self.cleanup_at(keep_days, dry_run, Utc::now())
    }

    pub fn cleanup_at(&self, keep_days: u32, dry_run: bool, now: DateTime<Utc>) -> Result<Vec<ArchiveEntry>> {
        let cutoff = now - Duration::days(keep_days.into());
        let expired: Vec<ArchiveEntry> = self
            .list()?
            .into_iter()
            .filter(|e| e.created_at < cutoff || e.retention_until < now)
            .collect();

        for entry in &expired {
            if dry_run {
                info!("Would delete archive {} ({})", entry.archive_id, entry.blob_location);
            } else {
                self.store.delete(&entry.blob_location)?;
                info!("Deleted archive {} ({})", entry.archive_id, entry.blob_location);
            }
        }
        Ok(expired)
    }
}
