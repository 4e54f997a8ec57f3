//! Prompt prefix-cache accounting store.

use serde::Deserialize;
use url::Url;

/// Prompt prefix-cache accounting store.
///
/// Accounting is a side channel on the Anthropic dialect; when disabled or
/// unreachable the gateway reports everything as uncached.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PrefixCacheConfig {
    /// Whether prefix-cache accounting is performed at all.
    pub enabled: bool,
    /// Key-value store URL, e.g. `redis://127.0.0.1:6379`.
    pub url: Option<Url>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn disabled_by_default() {
        let config: PrefixCacheConfig = toml::from_str("").unwrap();
        assert!(!config.enabled);
        assert!(config.url.is_none());
    }

    #[test]
    fn parses_store_url() {
        let config: PrefixCacheConfig = toml::from_str(indoc! {r#"
            enabled = true
            url = "redis://127.0.0.1:6379"
        "#})
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.url.unwrap().scheme(), "redis");
    }
}
