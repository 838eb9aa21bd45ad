//! Deterministic content fingerprints for source records.

use crate::record::{BusinessKey, KeyColumns, SourceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Columns never included in a fingerprint: generated identifiers,
/// timestamps, filter metadata and the stored hash itself.
pub const DEFAULT_VOLATILE_COLUMNS: &[&str] = &[
    "id",
    "item_id",
    "external_id",
    "created_at",
    "updated_at",
    "synced_at",
    "extracted_at",
    "customer_filter",
    "batch_id",
    "row_hash",
];

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// 256-bit SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid hash '{}': {}", s, e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("invalid hash '{}': expected 32 bytes", s))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fingerprint of one business key for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub key: BusinessKey,
    pub hash: ContentHash,
    pub computed_at: DateTime<Utc>,
}

/// Computes fingerprints over a canonical projection of named columns.
#[derive(Debug, Clone)]
pub struct Hasher {
    key_columns: KeyColumns,
    volatile: BTreeSet<String>,
}

impl Hasher {
    /// Create a hasher excluding the default volatile columns plus `extra`.
    pub fn new(key_columns: KeyColumns, extra: impl IntoIterator<Item = String>) -> Self {
        let volatile = DEFAULT_VOLATILE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(extra)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self {
            key_columns,
            volatile,
        }
    }

    pub fn key_columns(&self) -> &KeyColumns {
        &self.key_columns
    }

    pub fn is_volatile(&self, column: &str) -> bool {
        self.volatile.contains(&column.to_ascii_lowercase())
    }

    /// Canonical string the digest is computed over.
    pub fn canonical_projection(&self, record: &SourceRecord) -> String {
        let mut out = String::new();
        for (name, value) in record.columns() {
            if self.is_volatile(name) {
                continue;
            }
            out.push_str(name);
            out.push(FIELD_SEP);
            out.push_str(&value.canonical());
            out.push(RECORD_SEP);
        }
        out
    }

    pub fn digest(&self, record: &SourceRecord) -> ContentHash {
        ContentHash::of(self.canonical_projection(record).as_bytes())
    }

    /// Fingerprint a record.
    ///
    /// Fails with the missing key components when the business key cannot be
    /// resolved.
    pub fn fingerprint(
        &self,
        record: &SourceRecord,
    ) -> std::result::Result<Fingerprint, Vec<String>> {
        let key = BusinessKey::from_record(record, &self.key_columns)?;
        Ok(Fingerprint {
            key,
            hash: self.digest(record),
            computed_at: Utc::now(),
        })
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(KeyColumns::default(), Vec::new())
    }
}
