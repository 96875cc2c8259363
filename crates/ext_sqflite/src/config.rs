//! Plugin configuration and call option structures.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::session::DEFAULT_BUSY_TIMEOUT;

/// Construction-time configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqfliteConfig {
    /// Directory reported by `getDatabasesPath` (default: platform data dir)
    pub databases_path: Option<PathBuf>,
    /// Busy timeout in milliseconds (default: 2500)
    pub busy_timeout_ms: Option<u64>,
}

impl SqfliteConfig {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn databases_path(&self) -> PathBuf {
        self.databases_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("sqflite"))
                .unwrap_or_else(|| PathBuf::from("."))
                .join("databases")
        })
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BUSY_TIMEOUT)
    }
}

/// Options passed with `openDatabase`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOptions {
    #[serde(default)]
    pub path: String,
    /// Open in read-only mode (default: false)
    pub read_only: Option<bool>,
    /// Share one session per path (default: false)
    pub single_instance: Option<bool>,
}

/// Process-wide options set by the `options` call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginOptions {
    /// Shape query results as a list of column maps (default: false)
    pub query_as_map_list: Option<bool>,
    pub log_level: Option<i64>,
}
