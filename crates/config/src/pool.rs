//! Credential pool behaviour.

use std::time::Duration;

use serde::Deserialize;

/// Credential pool behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Consecutive errors before a credential is quarantined.
    pub max_error_count: u32,
    /// Initial quarantine cooldown; doubles with each consecutive quarantine.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub quarantine_base: Duration,
    /// Upper bound on the quarantine cooldown.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub quarantine_cap: Duration,
    /// Concurrency slots per credential when slot acquisition is requested.
    pub slots_per_credential: u32,
    /// Parallelism bound for adapter warmup at boot.
    pub warmup_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_error_count: 3,
            quarantine_base: Duration::from_secs(1),
            quarantine_cap: Duration::from_secs(30),
            slots_per_credential: 8,
            warmup_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: PoolConfig = toml::from_str("").unwrap();

        assert_eq!(config.max_error_count, 3);
        assert_eq!(config.quarantine_base, Duration::from_secs(1));
        assert_eq!(config.quarantine_cap, Duration::from_secs(30));
        assert_eq!(config.slots_per_credential, 8);
    }
}
