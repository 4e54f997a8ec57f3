//! HTTP server configuration settings.

use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// Shared API key every request must present as a bearer token.
    pub api_key: Option<SecretString>,
    /// Health endpoint configuration.
    pub health: HealthConfig,
    /// Upstream HTTP client behaviour.
    pub client: ClientConfig,
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Whether the health endpoint is exposed.
    pub enabled: bool,
    /// Path the health endpoint is served on.
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
        }
    }
}

/// Upstream HTTP client behaviour shared by all adapters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// TCP connect timeout.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub connect_timeout: Duration,
    /// Total timeout for non-streaming upstream calls.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub request_timeout: Duration,
    /// Maximum silence between events on a streaming upstream call.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub stream_idle_timeout: Duration,
    /// Maximum sockets kept per upstream host.
    pub max_sockets_per_host: usize,
    /// Full-request retries before giving up on a completion.
    pub max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            max_sockets_per_host: 100,
            max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn client_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();

        assert_eq!(config.client.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.client.request_timeout, Duration::from_secs(120));
        assert_eq!(config.client.stream_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.client.max_sockets_per_host, 100);
        assert_eq!(config.client.max_attempts, 3);
    }

    #[test]
    fn parses_durations_from_strings() {
        let config: ServerConfig = toml::from_str(indoc! {r#"
            listen_address = "127.0.0.1:8080"

            [client]
            connect_timeout = "10s"
            request_timeout = "2m"
            stream_idle_timeout = "45s"
        "#})
        .unwrap();

        assert_eq!(config.client.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.client.request_timeout, Duration::from_secs(120));
        assert_eq!(config.client.stream_idle_timeout, Duration::from_secs(45));
    }

    #[test]
    fn health_defaults_to_enabled() {
        let config: ServerConfig = toml::from_str("").unwrap();

        assert!(config.health.enabled);
        assert_eq!(config.health.path, "/health");
    }
}
