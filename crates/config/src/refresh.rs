//! Background token refresh behaviour.

use std::time::Duration;

use serde::Deserialize;

/// Background token refresh behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    /// Period of the refresh scheduler tick.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub interval: Duration,
    /// A token expiring within this window counts as near-expiry.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub expiry_skew: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            expiry_skew: Duration::from_secs(5 * 60),
        }
    }
}
