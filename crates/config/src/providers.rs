//! Upstream provider configuration.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// The family of an upstream provider.
///
/// Credentials, fallback chains and adapters are all keyed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible public API.
    Openai,
    /// Anthropic Messages public API.
    Anthropic,
    /// Google Gemini GenerateContent public API.
    Gemini,
    /// The Grok web-chat backend, driven through its private endpoints.
    Grok,
}

impl ProviderKind {
    /// All known provider kinds, in configuration order.
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Openai,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::Grok,
    ];

    /// The lowercase name used in configuration keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Grok => "grok",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Override for the provider's API base URL.
    pub base_url: Option<Url>,
    /// Base URL scheme-less asset links are resolved against (web-chat providers).
    pub asset_base_url: Option<Url>,
    /// Ordered substitutes tried when this provider has no eligible credential.
    pub fallback: Vec<FallbackRule>,
}

/// A single entry of a provider fallback chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackRule {
    /// The provider to fall back to.
    pub provider: ProviderKind,
    /// Model to substitute when routing to the fallback provider.
    #[serde(default)]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use indoc::indoc;

    #[test]
    fn provider_kind_round_trips_lowercase() {
        for kind in ProviderKind::ALL {
            let serialized = serde_json::to_string(&kind).unwrap();
            assert_eq!(serialized, format!("\"{kind}\""));
        }
    }

    #[test]
    fn fallback_chain_parses_in_order() {
        let providers: IndexMap<ProviderKind, ProviderConfig> = toml::from_str(indoc! {r#"
            [anthropic]
            fallback = [
                { provider = "openai", model = "gpt-4o" },
                { provider = "gemini" },
            ]

            [openai]
        "#})
        .unwrap();

        let chain = &providers[&ProviderKind::Anthropic].fallback;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].provider, ProviderKind::Openai);
        assert_eq!(chain[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(chain[1].provider, ProviderKind::Gemini);
        assert!(chain[1].model.is_none());
    }
}
