//! Database configuration.
//!
//! [`DatabaseConfig`] is the construction shape hosts hand in (usually parsed
//! from JSON). [`ConfigSnapshot`] is built from it exactly once and shared as
//! an `Arc` by every thread that needs to read configuration. There are no
//! setters on the snapshot.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Default WAL size after which the engine checkpoints.
pub const DEFAULT_CHECKPOINT_WAL_SIZE: u64 = 16 * 1024 * 1024;

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    #[default]
    Automatic,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NullOrder {
    #[default]
    NullsFirst,
    NullsLast,
}

/// Engine options. Every field is optional; omitted ones keep engine
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatabaseOptions {
    pub access_mode: Option<AccessMode>,
    #[serde(rename = "checkpointWALSize")]
    pub checkpoint_wal_size: Option<u64>,
    #[serde(rename = "useDirectIO")]
    pub use_direct_io: Option<bool>,
    /// Memory ceiling in bytes.
    pub maximum_memory: Option<u64>,
    pub use_temporary_directory: Option<bool>,
    pub temporary_directory: Option<String>,
    pub collation: Option<String>,
    pub default_order_type: Option<OrderType>,
    pub default_null_order: Option<NullOrder>,
    pub enable_copy: Option<bool>,
}

/// Construction configuration: `{ "path": ..., "options": { ... } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database file. Empty or `:memory:` opens an in-memory database.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub options: DatabaseOptions,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            options: DatabaseOptions::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    pub fn with_options(mut self, options: DatabaseOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse a configuration document. Wrong shapes and unknown keys are
    /// rejected with [`DbError::Construction`].
    pub fn from_json(json: &str) -> Result<Self, DbError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DbError::Construction(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot::from_options(&self.path, &self.options))
    }
}

/// Immutable, fully-resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    path: String,
    access_mode: AccessMode,
    #[serde(rename = "checkpointWALSize")]
    checkpoint_wal_size: u64,
    #[serde(rename = "useDirectIO")]
    use_direct_io: bool,
    maximum_memory: Option<u64>,
    use_temporary_directory: bool,
    temporary_directory: String,
    collation: String,
    default_order_type: OrderType,
    default_null_order: NullOrder,
    enable_copy: bool,
}

impl ConfigSnapshot {
    pub fn from_options(path: &str, options: &DatabaseOptions) -> Self {
        Self {
            path: path.to_string(),
            access_mode: options.access_mode.unwrap_or_default(),
            checkpoint_wal_size: options
                .checkpoint_wal_size
                .unwrap_or(DEFAULT_CHECKPOINT_WAL_SIZE),
            use_direct_io: options.use_direct_io.unwrap_or(false),
            maximum_memory: options.maximum_memory,
            use_temporary_directory: options.use_temporary_directory.unwrap_or(true),
            temporary_directory: options.temporary_directory.clone().unwrap_or_default(),
            collation: options.collation.clone().unwrap_or_default(),
            default_order_type: options.default_order_type.unwrap_or_default(),
            default_null_order: options.default_null_order.unwrap_or_default(),
            enable_copy: options.enable_copy.unwrap_or(true),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_empty() || self.path == ":memory:"
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn checkpoint_wal_size(&self) -> u64 {
        self.checkpoint_wal_size
    }

    pub fn use_direct_io(&self) -> bool {
        self.use_direct_io
    }

    /// `None` means unlimited.
    pub fn maximum_memory(&self) -> Option<u64> {
        self.maximum_memory
    }

    pub fn use_temporary_directory(&self) -> bool {
        self.use_temporary_directory
    }

    pub fn temporary_directory(&self) -> &str {
        &self.temporary_directory
    }

    pub fn collation(&self) -> &str {
        &self.collation
    }

    pub fn default_order_type(&self) -> OrderType {
        self.default_order_type
    }

    pub fn default_null_order(&self) -> NullOrder {
        self.default_null_order
    }

    pub fn enable_copy(&self) -> bool {
        self.enable_copy
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::from_options(":memory:", &DatabaseOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_options_omitted() {
        let config = DatabaseConfig::from_json(r#"{ "path": "data.db" }"#).unwrap();
        let snapshot = config.snapshot();

        assert_eq!(snapshot.path(), "data.db");
        assert!(!snapshot.is_in_memory());
        assert_eq!(snapshot.access_mode(), AccessMode::Automatic);
        assert_eq!(snapshot.checkpoint_wal_size(), 16 * 1024 * 1024);
        assert!(!snapshot.use_direct_io());
        assert_eq!(snapshot.maximum_memory(), None);
        assert!(snapshot.use_temporary_directory());
        assert_eq!(snapshot.temporary_directory(), "");
        assert_eq!(snapshot.collation(), "");
        assert_eq!(snapshot.default_order_type(), OrderType::Asc);
        assert_eq!(snapshot.default_null_order(), NullOrder::NullsFirst);
        assert!(snapshot.enable_copy());
    }

    #[test]
    fn test_options_use_camel_case_keys() {
        let config = DatabaseConfig::from_json(
            r#"{
                "path": "",
                "options": {
                    "accessMode": "readOnly",
                    "checkpointWALSize": 1048576,
                    "useDirectIO": true,
                    "maximumMemory": 268435456,
                    "useTemporaryDirectory": false,
                    "temporaryDirectory": "/tmp/hostdb",
                    "collation": "nocase",
                    "defaultOrderType": "desc",
                    "defaultNullOrder": "nullsLast",
                    "enableCopy": false
                }
            }"#,
        )
        .unwrap();
        let snapshot = config.snapshot();

        assert!(snapshot.is_in_memory());
        assert_eq!(snapshot.access_mode(), AccessMode::ReadOnly);
        assert_eq!(snapshot.checkpoint_wal_size(), 1_048_576);
        assert!(snapshot.use_direct_io());
        assert_eq!(snapshot.maximum_memory(), Some(268_435_456));
        assert!(!snapshot.use_temporary_directory());
        assert_eq!(snapshot.temporary_directory(), "/tmp/hostdb");
        assert_eq!(snapshot.collation(), "nocase");
        assert_eq!(snapshot.default_order_type(), OrderType::Desc);
        assert_eq!(snapshot.default_null_order(), NullOrder::NullsLast);
        assert!(!snapshot.enable_copy());
    }

    #[test]
    fn test_malformed_shapes_are_construction_errors() {
        for doc in [
            r#""memory""#,
            r#"{ "path": 7 }"#,
            r#"{ "options": "fast" }"#,
            r#"{ "options": { "accessMode": "sometimes" } }"#,
            r#"{ "options": { "turbo": true } }"#,
            r#"{ "path": "a.db", "extra": 1 }"#,
        ] {
            let err = DatabaseConfig::from_json(doc).unwrap_err();
            assert!(matches!(err, DbError::Construction(_)), "accepted {doc}");
        }
    }

    #[test]
    fn test_snapshot_serializes_with_config_keys() {
        let json = serde_json::to_value(ConfigSnapshot::default()).unwrap();
        assert_eq!(json["checkpointWALSize"], 16 * 1024 * 1024);
        assert_eq!(json["defaultNullOrder"], "nullsFirst");
        assert_eq!(json["accessMode"], "automatic");
    }
}
