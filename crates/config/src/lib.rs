//! Relay configuration structures to map the relay.toml configuration.

#![deny(missing_docs)]

mod cache;
mod loader;
mod pool;
mod providers;
mod refresh;
mod server;
mod storage;

pub use cache::PrefixCacheConfig;
pub use loader::load;
pub use pool::PoolConfig;
pub use providers::{FallbackRule, ProviderConfig, ProviderKind};
pub use refresh::RefreshConfig;
pub use server::{ClientConfig, HealthConfig, ServerConfig};
pub use storage::StorageConfig;

use indexmap::IndexMap;
use serde::Deserialize;

/// Main configuration structure for the relay application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Upstream provider configuration, keyed by provider name.
    pub providers: IndexMap<ProviderKind, ProviderConfig>,
    /// Credential pool behaviour.
    pub pool: PoolConfig,
    /// Background token refresh behaviour.
    pub refresh: RefreshConfig,
    /// Prompt prefix-cache accounting store.
    pub cache: PrefixCacheConfig,
    /// Persisted state locations.
    pub storage: StorageConfig,
}

impl Config {
    /// Whether at least one provider is configured.
    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }
}
