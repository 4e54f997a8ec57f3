//! Builds the gateway runtime from configuration: credentials, adapters,
//! pool, refresher and the background tasks.

use std::collections::HashMap;
use std::sync::Arc;

use config::{Config, ProviderKind};
use futures::StreamExt;

use crate::{
    error::{GatewayError, GatewayResult},
    pool::CredentialPool,
    prefix_cache::PrefixCacheAccountant,
    provider::{
        Adapter, anthropic::AnthropicAdapter, gemini::GeminiAdapter, grok::GrokAdapter, openai::OpenAiAdapter,
    },
    refresh::TokenRefresher,
    server::GatewayServer,
    storage::{self, UsageCacheWriter},
};

pub(crate) struct GatewayServerBuilder<'a> {
    config: &'a Config,
}

impl<'a> GatewayServerBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub async fn build(self) -> GatewayResult<GatewayServer> {
        log::debug!(
            "Initializing gateway with {} provider(s)",
            self.config.providers.len()
        );

        let mut adapters: HashMap<ProviderKind, Arc<dyn Adapter>> = HashMap::new();

        for (kind, provider_config) in &self.config.providers {
            log::debug!("Initializing provider: {kind}");

            let adapter: Arc<dyn Adapter> = match kind {
                ProviderKind::Openai => Arc::new(OpenAiAdapter::new(provider_config)),
                ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(provider_config)),
                ProviderKind::Gemini => Arc::new(GeminiAdapter::new(provider_config)),
                ProviderKind::Grok => Arc::new(GrokAdapter::new(provider_config)),
            };

            adapters.insert(*kind, adapter);
        }

        if adapters.is_empty() {
            return Err(GatewayError::Internal(Some(
                "No upstream providers configured.".to_string(),
            )));
        }

        let credentials = storage::load_credentials(&self.config.storage.credentials_path).map_err(|e| {
            log::error!("Failed to load credential store: {e:#}");
            GatewayError::Internal(Some(format!("Failed to load credential store: {e}")))
        })?;

        // Credentials for providers that are not configured cannot be used.
        let (usable, orphaned): (Vec<_>, Vec<_>) = credentials
            .into_iter()
            .partition(|c| adapters.contains_key(&c.provider));

        for credential in &orphaned {
            log::warn!(
                "Ignoring credential {} for unconfigured provider '{}'",
                credential.display_name(),
                credential.provider,
            );
        }

        let fallbacks = self
            .config
            .providers
            .iter()
            .filter(|(_, p)| !p.fallback.is_empty())
            .map(|(kind, p)| (*kind, p.fallback.clone()))
            .collect();

        let pool = Arc::new(CredentialPool::new(usable, fallbacks, self.config.pool.clone()));

        let refresher = Arc::new(TokenRefresher::new(
            adapters.clone(),
            pool.clone(),
            self.config.refresh.clone(),
        ));

        let accountant = PrefixCacheAccountant::new(&self.config.cache);
        let usage_cache = Arc::new(UsageCacheWriter::new(self.config.storage.usage_cache_path.clone()));

        let server = GatewayServer::new(
            adapters.clone(),
            pool.clone(),
            refresher.clone(),
            accountant,
            usage_cache,
            self.config.server.client.clone(),
        );

        warmup(&adapters, &pool, self.config.pool.warmup_concurrency).await;

        // Background refresh scheduler and usage sweep live for the process.
        tokio::spawn(refresher.run());

        let sweep_server = server.clone();
        let sweep_interval = self.config.refresh.interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                sweep_server.usage_sweep().await;
            }
        });

        Ok(server)
    }
}

/// Initialise every adapter-credential pair in parallel, bounded. Failures
/// downgrade health but never abort startup.
async fn warmup(
    adapters: &HashMap<ProviderKind, Arc<dyn Adapter>>,
    pool: &Arc<CredentialPool>,
    concurrency: usize,
) {
    let credentials = pool.all_credentials().await;

    if credentials.is_empty() {
        log::warn!("Credential store is empty; every request will fail over to nothing");
        return;
    }

    let warmups = credentials.into_iter().filter_map(|credential| {
        let adapter = adapters.get(&credential.provider)?.clone();
        let pool = pool.clone();

        Some(async move {
            if let Err(e) = adapter.warmup(&credential).await {
                log::warn!(
                    "Warmup failed for credential {} (provider '{}'): {e}",
                    credential.display_name(),
                    credential.provider,
                );
                pool.mark_refresh_failure(&credential, &e.to_string()).await;
            }
        })
    });

    futures::stream::iter(warmups)
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<()>>()
        .await;
}
