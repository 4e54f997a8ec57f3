//! Persisted state locations.

use std::path::PathBuf;

use serde::Deserialize;

/// Persisted state locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// JSON document holding credential records, keyed by provider kind.
    pub credentials_path: PathBuf,
    /// JSON document holding the advisory usage snapshot cache.
    pub usage_cache_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("data/credentials.json"),
            usage_cache_path: PathBuf::from("data/usage.json"),
        }
    }
}
