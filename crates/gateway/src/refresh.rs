//! Background OAuth token refresh with per-credential single-flight.

use std::collections::HashMap;
use std::sync::Arc;

use config::{ProviderKind, RefreshConfig};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use uuid::Uuid;

use crate::{
    error::{GatewayError, GatewayResult},
    pool::{CredentialPool, credential::Credential},
    provider::Adapter,
};

type RefreshFuture = Shared<BoxFuture<'static, Result<(), Arc<GatewayError>>>>;

/// Single-flight background refresher for OAuth access tokens.
///
/// Concurrent callers for the same credential join the in-flight refresh
/// instead of issuing duplicates. Refresh failures bump the credential's
/// error counter but never quarantine by themselves.
pub(crate) struct TokenRefresher {
    adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
    pool: Arc<CredentialPool>,
    config: RefreshConfig,
    in_flight: DashMap<Uuid, RefreshFuture>,
}

impl TokenRefresher {
    pub fn new(
        adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
        pool: Arc<CredentialPool>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            adapters,
            pool,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Whether the credential's token (or snapshot window) is near expiry.
    pub fn is_expiry_near(&self, credential: &Credential) -> bool {
        credential.is_expiry_near(self.config.expiry_skew)
    }

    /// Refresh if the token is near expiry, joining any in-flight refresh.
    pub async fn refresh(&self, credential: Arc<Credential>) -> GatewayResult<()> {
        if !self.is_expiry_near(&credential) {
            return Ok(());
        }

        self.force_refresh(credential).await
    }

    /// Refresh unconditionally, joining any in-flight refresh.
    pub async fn force_refresh(&self, credential: Arc<Credential>) -> GatewayResult<()> {
        let Some(adapter) = self.adapters.get(&credential.provider).cloned() else {
            return Err(GatewayError::ProviderNotFound(credential.provider.to_string()));
        };

        let future = {
            use dashmap::mapref::entry::Entry;

            match self.in_flight.entry(credential.uuid) {
                Entry::Occupied(existing) => existing.get().clone(),
                Entry::Vacant(vacant) => {
                    let refresh_target = credential.clone();
                    let future: RefreshFuture = async move {
                        adapter
                            .refresh_credential(&refresh_target)
                            .await
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();

                    vacant.insert(future.clone());
                    future
                }
            }
        };

        let result = future.clone().await;

        // Only the exact future we awaited is removed, so a refresh started
        // after this one completed is left untouched.
        self.in_flight
            .remove_if(&credential.uuid, |_, current| current.ptr_eq(&future));

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                log::warn!(
                    "Token refresh failed for credential {} (provider '{}'): {error}",
                    credential.display_name(),
                    credential.provider,
                );
                self.pool.mark_refresh_failure(&credential, &error.to_string()).await;

                Err(GatewayError::Internal(Some(error.to_string())))
            }
        }
    }

    /// One scheduler tick: refresh every near-expiry credential, serially
    /// per provider so a batch does not trip upstream rate limits.
    pub async fn tick(&self) {
        let near = self.pool.near_expiry(self.config.expiry_skew).await;

        if near.is_empty() {
            return;
        }

        log::debug!("Refreshing {} near-expiry credential(s)", near.len());

        let mut by_provider: HashMap<ProviderKind, Vec<Arc<Credential>>> = HashMap::new();
        for credential in near {
            by_provider.entry(credential.provider).or_default().push(credential);
        }

        for (provider, credentials) in by_provider {
            for credential in credentials {
                if let Err(e) = self.force_refresh(credential).await {
                    log::debug!("Scheduled refresh failed for provider '{provider}': {e}");
                }
            }
        }
    }

    /// Run the refresh scheduler until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The immediate first tick would race warmup.
        interval.tick().await;

        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedModel, UnifiedRequest, UnifiedResponse};
    use crate::pool::credential::SecretMaterial;
    use crate::provider::ChatStream;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, SystemTime};

    struct SlowRefreshAdapter {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl Adapter for SlowRefreshAdapter {
        fn provider(&self) -> ProviderKind {
            ProviderKind::Anthropic
        }

        async fn generate(&self, _: &Credential, _: UnifiedRequest) -> GatewayResult<UnifiedResponse> {
            Err(GatewayError::Internal(None))
        }

        async fn generate_stream(&self, _: &Credential, _: UnifiedRequest) -> GatewayResult<ChatStream> {
            Err(GatewayError::Internal(None))
        }

        async fn list_models(&self, _: &Credential) -> anyhow::Result<Vec<UnifiedModel>> {
            Ok(Vec::new())
        }

        async fn refresh_credential(&self, credential: &Credential) -> GatewayResult<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;

            credential.install_access_token(
                SecretString::from("fresh".to_string()),
                Some(SystemTime::now() + Duration::from_secs(3600)),
            );

            Ok(())
        }
    }

    fn oauth_credential() -> Arc<Credential> {
        Arc::new(Credential::new(
            Uuid::new_v4(),
            ProviderKind::Anthropic,
            None,
            None,
            false,
            SecretMaterial::OAuth {
                access_token: SecretString::from("stale".to_string()),
                refresh_token: SecretString::from("rt".to_string()),
                expires_at: Some(SystemTime::now()),
            },
        ))
    }

    #[tokio::test]
    async fn concurrent_refreshes_single_flight() {
        let credential = oauth_credential();
        let adapter = Arc::new(SlowRefreshAdapter {
            refreshes: AtomicU32::new(0),
        });

        let pool = Arc::new(CredentialPool::new(
            vec![credential.clone()],
            HashMap::new(),
            config::PoolConfig::default(),
        ));

        let mut adapters: HashMap<ProviderKind, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(ProviderKind::Anthropic, adapter.clone());

        let refresher = Arc::new(TokenRefresher::new(adapters, pool, RefreshConfig::default()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let refresher = refresher.clone();
                let credential = credential.clone();
                tokio::spawn(async move { refresher.force_refresh(credential).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // All eight callers joined one in-flight refresh.
        assert_eq!(adapter.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_skips_fresh_tokens() {
        let credential = oauth_credential();
        credential.install_access_token(
            SecretString::from("valid".to_string()),
            Some(SystemTime::now() + Duration::from_secs(24 * 3600)),
        );

        let adapter = Arc::new(SlowRefreshAdapter {
            refreshes: AtomicU32::new(0),
        });

        let pool = Arc::new(CredentialPool::new(
            vec![credential.clone()],
            HashMap::new(),
            config::PoolConfig::default(),
        ));

        let mut adapters: HashMap<ProviderKind, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(ProviderKind::Anthropic, adapter.clone());

        let refresher = TokenRefresher::new(adapters, pool, RefreshConfig::default());

        refresher.refresh(credential).await.unwrap();

        assert_eq!(adapter.refreshes.load(Ordering::SeqCst), 0);
    }
}
