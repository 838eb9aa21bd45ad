//! Configuration validation.

use super::Config;
use crate::db::SslMode;
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Database validation
    if config.database.host.is_empty() {
        return Err(SyncError::Config("database.host is required".into()));
    }
    if config.database.database.is_empty() {
        return Err(SyncError::Config("database.database is required".into()));
    }
    if config.database.user.is_empty() {
        return Err(SyncError::Config("database.user is required".into()));
    }
    SslMode::parse(&config.database.ssl_mode)?;
    validate_identifier("database.state_schema", &config.database.state_schema)?;
    validate_identifier(
        "database.production_schema",
        &config.database.production_schema,
    )?;
    if config.database.state_schema == config.database.production_schema {
        return Err(SyncError::Config(
            "database.state_schema and database.production_schema must differ".into(),
        ));
    }
    if config.database.max_connections == 0 {
        return Err(SyncError::Config(
            "database.max_connections must be at least 1".into(),
        ));
    }

    // Source validation
    if config.source.table.is_empty() {
        return Err(SyncError::Config("source.table is required".into()));
    }
    let keys = config.source.key_columns.names();
    for (i, name) in keys.iter().enumerate() {
        if name.is_empty() {
            return Err(SyncError::Config(
                "source.key_columns entries must not be empty".into(),
            ));
        }
        if keys[..i].iter().any(|k| k.eq_ignore_ascii_case(name)) {
            return Err(SyncError::Config(format!(
                "source.key_columns lists '{}' twice",
                name
            )));
        }
    }
    if let Some(col) = config
        .source
        .volatile_columns
        .iter()
        .find(|c| config.source.key_columns.contains(c))
    {
        return Err(SyncError::Config(format!(
            "source.volatile_columns cannot exclude key column '{}'",
            col
        )));
    }
    if config.source.size_column_prefix.is_empty() {
        return Err(SyncError::Config(
            "source.size_column_prefix is required".into(),
        ));
    }

    // Platform validation
    if !config.platform.api_url.starts_with("https://")
        && !config.platform.api_url.starts_with("http://")
    {
        return Err(SyncError::Config(format!(
            "platform.api_url must be an http(s) URL, got '{}'",
            config.platform.api_url
        )));
    }
    if config.platform.api_token.is_empty() {
        return Err(SyncError::Config("platform.api_token is required".into()));
    }
    if config.platform.board_id.is_empty() {
        return Err(SyncError::Config("platform.board_id is required".into()));
    }
    if config.platform.max_items_per_call == 0 {
        return Err(SyncError::Config(
            "platform.max_items_per_call must be at least 1".into(),
        ));
    }

    // Sync validation
    let sync = &config.sync;
    if sync.batch_size == 0 {
        return Err(SyncError::Config("sync.batch_size must be at least 1".into()));
    }
    if sync.max_attempts == 0 {
        return Err(SyncError::Config("sync.max_attempts must be at least 1".into()));
    }
    if sync.backoff_multiplier.is_nan() || sync.backoff_multiplier < 1.0 {
        return Err(SyncError::Config(
            "sync.backoff_multiplier must be at least 1.0".into(),
        ));
    }
    if sync.max_backoff_ms < sync.initial_backoff_ms {
        return Err(SyncError::Config(
            "sync.max_backoff_ms must not be below sync.initial_backoff_ms".into(),
        ));
    }
    if sync.max_in_flight == 0 {
        return Err(SyncError::Config("sync.max_in_flight must be at least 1".into()));
    }
    if sync.max_concurrent_batches == 0 {
        return Err(SyncError::Config(
            "sync.max_concurrent_batches must be at least 1".into(),
        ));
    }

    // Archive validation
    if config.archive.retention_days == 0 {
        return Err(SyncError::Config(
            "archive.retention_days must be at least 1".into(),
        ));
    }

    Ok(())
}

/// Plain PostgreSQL identifier: letters, digits and underscores, at most 63
/// bytes, not starting with a digit.
fn validate_identifier(field: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::Config(format!(
            "{} must be a plain identifier, got '{}'",
            field, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveConfig, DatabaseConfig, PlatformConfig, SourceConfig, SyncConfig};
    use std::collections::BTreeMap;

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "orders".to_string(),
                user: "sync".to_string(),
                password: "password".to_string(),
                ssl_mode: "disable".to_string(),
                state_schema: "order_sync".to_string(),
                production_schema: "public".to_string(),
                max_connections: 8,
            },
            source: SourceConfig::default(),
            platform: PlatformConfig {
                api_url: "https://api.example.com/v2".to_string(),
                api_token: "token".to_string(),
                board_id: "1".to_string(),
                subitem_board_id: None,
                request_timeout_secs: 30,
                connect_timeout_secs: 10,
                max_items_per_call: 50,
                column_map: BTreeMap::new(),
                quantity_column: "quantity".to_string(),
            },
            sync: SyncConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_database_host() {
        let mut config = valid_config();
        config.database.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_ssl_mode() {
        let mut config = valid_config();
        config.database.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_schemas_rejected() {
        let mut config = valid_config();
        config.database.state_schema = "public".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_schema_names_must_be_identifiers() {
        for bad in ["order_sync; DROP TABLE x", "9sync", "", "sync\"schema", "order-sync"] {
            let mut config = valid_config();
            config.database.state_schema = bad.to_string();
            assert!(validate(&config).is_err(), "accepted state_schema {:?}", bad);

            let mut config = valid_config();
            config.database.production_schema = bad.to_string();
            assert!(validate(&config).is_err(), "accepted production_schema {:?}", bad);
        }

        let mut config = valid_config();
        config.database.state_schema = "_Order_Sync2".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_volatile_key_column_rejected() {
        let mut config = valid_config();
        config.source.volatile_columns = vec!["Style".to_string()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_key_column_rejected() {
        let mut config = valid_config();
        config.source.key_columns.color = config.source.key_columns.style.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = valid_config();
        config.sync.max_attempts = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.sync.max_concurrent_batches = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.sync.backoff_multiplier = 0.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_database_config_debug_redacts_password() {
        let mut config = valid_config();
        config.database.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.database);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_platform_config_debug_redacts_token() {
        let mut config = valid_config();
        config.platform.api_token = "super_secret_token_456".to_string();
        let debug_output = format!("{:?}", config.platform);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_token_456"));
    }
}
