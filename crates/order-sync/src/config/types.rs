//! Configuration type definitions.

use crate::record::KeyColumns;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// PostgreSQL holding the source table, staging, state and production tables.
    pub database: DatabaseConfig,

    /// Source table layout.
    #[serde(default)]
    pub source: SourceConfig,

    /// External work-tracking platform.
    pub platform: PlatformConfig,

    /// Push, retry and concurrency behavior.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Snapshot archiving.
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// PostgreSQL connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Schema for snapshots, batches and staging (default: "order_sync").
    #[serde(default = "default_state_schema")]
    pub state_schema: String,

    /// Schema for the production tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub production_schema: String,

    /// Maximum pooled connections (default: 8).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("state_schema", &self.state_schema)
            .field("production_schema", &self.production_schema)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Source table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Schema of the source table (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Source table name (default: "orders").
    #[serde(default = "default_source_table")]
    pub table: String,

    /// Columns forming the business key.
    #[serde(default)]
    pub key_columns: KeyColumns,

    /// Extra columns excluded from fingerprints, on top of the built-in set.
    #[serde(default)]
    pub volatile_columns: Vec<String>,

    /// Prefix of per-size quantity columns (default: "size_").
    #[serde(default = "default_size_prefix")]
    pub size_column_prefix: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            schema: default_public_schema(),
            table: default_source_table(),
            key_columns: KeyColumns::default(),
            volatile_columns: Vec::new(),
            size_column_prefix: default_size_prefix(),
        }
    }
}

/// External platform configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// GraphQL endpoint.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API token sent as the Authorization header.
    pub api_token: String,

    /// Board that receives order items.
    pub board_id: String,

    /// Board holding sub-items, needed for sub-item updates (default: `board_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subitem_board_id: Option<String>,

    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Largest number of mutations per request (default: 50).
    #[serde(default = "default_max_items_per_call")]
    pub max_items_per_call: usize,

    /// Source column name to platform column id. Unmapped columns are not sent.
    #[serde(default)]
    pub column_map: BTreeMap<String, String>,

    /// Platform column id receiving sub-item quantities (default: "quantity").
    #[serde(default = "default_quantity_column")]
    pub quantity_column: String,
}

impl PlatformConfig {
    pub fn subitem_board(&self) -> &str {
        self.subitem_board_id.as_deref().unwrap_or(&self.board_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &"[REDACTED]")
            .field("board_id", &self.board_id)
            .field("subitem_board_id", &self.subitem_board_id)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("max_items_per_call", &self.max_items_per_call)
            .field("column_map", &self.column_map)
            .field("quantity_column", &self.quantity_column)
            .finish()
    }
}

/// Synchronization behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Items per platform call, capped by `platform.max_items_per_call` (default: 25).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per record before giving up (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff in milliseconds (default: 500).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff growth factor (default: 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Backoff ceiling in milliseconds (default: 30000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Concurrent requests to the platform (default: 4).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Minimum spacing between request starts in milliseconds (default: 250).
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Customer batches running at once (default: 4).
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Default customer filter; a run option overrides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_filter: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            max_in_flight: default_max_in_flight(),
            min_interval_ms: default_min_interval_ms(),
            max_concurrent_batches: default_max_concurrent_batches(),
            customer_filter: None,
        }
    }
}

/// Snapshot archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive the full snapshot after each run (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding blobs and metadata sidecars (default: "archives").
    #[serde(default = "default_archive_root")]
    pub root: PathBuf,

    /// Days an archive is kept (default: 90).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_archive_root(),
            retention_days: default_retention_days(),
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_state_schema() -> String {
    "order_sync".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> usize {
    8
}

fn default_source_table() -> String {
    "orders".to_string()
}

fn default_size_prefix() -> String {
    "size_".to_string()
}

fn default_api_url() -> String {
    "https://api.monday.com/v2".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_items_per_call() -> usize {
    50
}

fn default_quantity_column() -> String {
    "quantity".to_string()
}

fn default_batch_size() -> usize {
    25
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_min_interval_ms() -> u64 {
    250
}

fn default_max_concurrent_batches() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("archives")
}

fn default_retention_days() -> u32 {
    90
}
