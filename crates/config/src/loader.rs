use std::path::Path;

use anyhow::bail;
use indoc::indoc;

use crate::Config;

/// Load and validate a configuration file.
pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if !config.has_providers() {
        bail!(indoc! {r#"
            No upstream providers configured. Relay requires at least one provider to function.

            Example configuration:

              [providers.openai]

              [providers.anthropic]
              fallback = [{ provider = "openai", model = "gpt-4o" }]

            Credentials for each provider are read from the credential store
            referenced by [storage].credentials_path.
        "#});
    }

    for (kind, provider) in &config.providers {
        for rule in &provider.fallback {
            if rule.provider == *kind {
                bail!("Provider '{kind}' lists itself in its own fallback chain");
            }

            if !config.providers.contains_key(&rule.provider) {
                bail!(
                    "Provider '{kind}' falls back to '{fallback}', which is not configured",
                    fallback = rule.provider
                );
            }
        }
    }

    if config.cache.enabled && config.cache.url.is_none() {
        bail!("Prefix cache is enabled but [cache].url is not set");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_snapshot;

    use crate::Config;

    #[test]
    fn rejects_empty_provider_set() {
        let config = Config::default();
        let error = super::validate(&config).unwrap_err().to_string();

        assert_snapshot!(error, @r#"
        No upstream providers configured. Relay requires at least one provider to function.

        Example configuration:

          [providers.openai]

          [providers.anthropic]
          fallback = [{ provider = "openai", model = "gpt-4o" }]

        Credentials for each provider are read from the credential store
        referenced by [storage].credentials_path.
        "#);
    }

    #[test]
    fn rejects_self_referencing_fallback() {
        let config: Config = toml::from_str(indoc! {r#"
            [providers.openai]
            fallback = [{ provider = "openai" }]
        "#})
        .unwrap();

        let error = super::validate(&config).unwrap_err().to_string();
        assert_snapshot!(error, @"Provider 'openai' lists itself in its own fallback chain");
    }

    #[test]
    fn rejects_fallback_to_unconfigured_provider() {
        let config: Config = toml::from_str(indoc! {r#"
            [providers.anthropic]
            fallback = [{ provider = "gemini" }]
        "#})
        .unwrap();

        let error = super::validate(&config).unwrap_err().to_string();
        assert_snapshot!(error, @"Provider 'anthropic' falls back to 'gemini', which is not configured");
    }

    #[test]
    fn rejects_cache_without_url() {
        let config: Config = toml::from_str(indoc! {r#"
            [providers.openai]

            [cache]
            enabled = true
        "#})
        .unwrap();

        let error = super::validate(&config).unwrap_err().to_string();
        assert_snapshot!(error, @"Prefix cache is enabled but [cache].url is not set");
    }

    #[test]
    fn accepts_complete_configuration() {
        let config: Config = toml::from_str(indoc! {r#"
            [server]
            listen_address = "127.0.0.1:8080"
            api_key = "secret"

            [providers.openai]

            [providers.grok]
            asset_base_url = "https://assets.grok.com"

            [providers.anthropic]
            fallback = [{ provider = "openai", model = "gpt-4o" }]

            [cache]
            enabled = true
            url = "redis://127.0.0.1:6379"

            [refresh]
            interval = "15m"
        "#})
        .unwrap();

        assert!(super::validate(&config).is_ok());
        assert_eq!(config.providers.len(), 3);
    }
}
