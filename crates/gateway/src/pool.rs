//! Credential pool management: selection, health, quarantine and failover.
//!
//! All mutations are serialised per provider behind a `tokio::sync::Mutex`;
//! selection reads and the `last_used_at` update happen atomically under that
//! lock, and the lock is always released before any network I/O.

pub(crate) mod credential;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use config::{FallbackRule, PoolConfig, ProviderKind};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::GatewayError;
use credential::Credential;

/// Grace period after token expiry during which a credential stays eligible.
const EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Selection options.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SelectOptions {
    /// Leave `last_used_at` untouched (health probes, warmup).
    pub skip_usage_count: bool,
    /// Reserve a concurrency slot on the selected credential.
    pub acquire_slot: bool,
}

/// A successful selection. Holds the pinned credential and, when requested,
/// the slot reservation which is released on drop.
#[derive(Debug)]
pub(crate) struct Acquired {
    pub credential: Arc<Credential>,
    pub provider: ProviderKind,
    pub model: String,
    pub is_fallback: bool,
    pub slot: Option<SlotGuard>,
}

/// Concurrency slot reservation; every acquire is released exactly once, on
/// every exit path including cancellation.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    credential: Arc<Credential>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.credential.release_slot();
    }
}

#[derive(Default)]
struct CredentialStatus {
    error_count: u32,
    consecutive_quarantines: u32,
    quarantined_until: Option<Instant>,
    last_error_msg: Option<String>,
    last_error_at: Option<SystemTime>,
    last_used_at: Option<Instant>,
}

struct PoolEntry {
    credential: Arc<Credential>,
    status: CredentialStatus,
}

#[derive(Default)]
struct ProviderPool {
    entries: Vec<PoolEntry>,
}

/// Read-only view of one credential for the admin surface.
#[derive(Debug, Clone)]
pub(crate) struct CredentialSnapshot {
    pub uuid: Uuid,
    pub provider: ProviderKind,
    pub custom_name: Option<String>,
    pub disabled: bool,
    pub quarantined: bool,
    pub error_count: u32,
    pub last_error_msg: Option<String>,
    pub last_error_at: Option<SystemTime>,
    pub in_flight: u32,
}

/// The credential pool for all providers.
pub(crate) struct CredentialPool {
    providers: HashMap<ProviderKind, Mutex<ProviderPool>>,
    fallbacks: HashMap<ProviderKind, Vec<FallbackRule>>,
    config: PoolConfig,
}

impl CredentialPool {
    pub fn new(
        credentials: Vec<Arc<Credential>>,
        fallbacks: HashMap<ProviderKind, Vec<FallbackRule>>,
        config: PoolConfig,
    ) -> Self {
        let mut providers: HashMap<ProviderKind, ProviderPool> = HashMap::new();

        for credential in credentials {
            providers
                .entry(credential.provider)
                .or_default()
                .entries
                .push(PoolEntry {
                    credential,
                    status: CredentialStatus::default(),
                });
        }

        Self {
            providers: providers.into_iter().map(|(k, v)| (k, Mutex::new(v))).collect(),
            fallbacks,
            config,
        }
    }

    /// Pick an eligible credential for the provider, walking the fallback
    /// chain when the primary pool has none.
    pub async fn acquire(
        &self,
        provider: ProviderKind,
        model: &str,
        options: SelectOptions,
    ) -> Result<Acquired, GatewayError> {
        if let Some(acquired) = self.select_from(provider, model, options, false).await {
            return Ok(acquired);
        }

        for rule in self.fallbacks.get(&provider).map(Vec::as_slice).unwrap_or_default() {
            let rewritten = rule.model.as_deref().unwrap_or(model);

            if let Some(mut acquired) = self.select_from(rule.provider, rewritten, options, true).await {
                log::info!(
                    "No eligible credential for provider '{provider}', falling back to '{fallback}' with model '{model}'",
                    fallback = rule.provider,
                    model = rewritten,
                );
                acquired.model = rewritten.to_string();
                return Ok(acquired);
            }
        }

        Err(GatewayError::NoHealthyCredential {
            provider: provider.to_string(),
        })
    }

    async fn select_from(
        &self,
        provider: ProviderKind,
        model: &str,
        options: SelectOptions,
        is_fallback: bool,
    ) -> Option<Acquired> {
        let pool = self.providers.get(&provider)?;
        let mut pool = pool.lock().await;
        let now = Instant::now();

        // Lift elapsed quarantines before filtering.
        for entry in &mut pool.entries {
            if let Some(until) = entry.status.quarantined_until
                && until <= now
            {
                entry.status.quarantined_until = None;
                entry.status.error_count = 0;
                log::info!(
                    "Credential {} left quarantine for provider '{provider}'",
                    entry.credential.display_name()
                );
            }
        }

        // Eligible entries ordered least recently used first.
        let mut candidates: Vec<usize> = pool
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                let credential = &entry.credential;

                !credential.is_disabled()
                    && entry.status.quarantined_until.is_none()
                    && credential.supports_model(model)
                    && credential
                        .token_expiry()
                        .is_none_or(|expiry| expiry + EXPIRY_GRACE > SystemTime::now())
            })
            .map(|(i, _)| i)
            .collect();

        candidates.sort_by_key(|&i| pool.entries[i].status.last_used_at);

        for index in candidates {
            let slot = if options.acquire_slot {
                if !pool.entries[index]
                    .credential
                    .try_acquire_slot(self.config.slots_per_credential)
                {
                    continue;
                }

                Some(SlotGuard {
                    credential: pool.entries[index].credential.clone(),
                })
            } else {
                None
            };

            if !options.skip_usage_count {
                pool.entries[index].status.last_used_at = Some(now);
            }

            return Some(Acquired {
                credential: pool.entries[index].credential.clone(),
                provider,
                model: model.to_string(),
                is_fallback,
                slot,
            });
        }

        None
    }

    /// Record a successful completion: error state resets.
    pub async fn mark_success(&self, credential: &Credential) {
        let Some(pool) = self.providers.get(&credential.provider) else {
            return;
        };
        let mut pool = pool.lock().await;

        if let Some(entry) = pool.entries.iter_mut().find(|e| e.credential.uuid == credential.uuid) {
            entry.status.error_count = 0;
            entry.status.consecutive_quarantines = 0;
            entry.status.last_error_msg = None;
        }
    }

    /// Record an upstream failure. Credential-scoped errors quarantine
    /// immediately; others count toward the configured threshold.
    pub async fn mark_failure(&self, credential: &Credential, error: &GatewayError) {
        let Some(pool) = self.providers.get(&credential.provider) else {
            return;
        };
        let mut pool = pool.lock().await;

        let Some(entry) = pool.entries.iter_mut().find(|e| e.credential.uuid == credential.uuid) else {
            return;
        };

        entry.status.error_count += 1;
        entry.status.last_error_msg = Some(error.to_string());
        entry.status.last_error_at = Some(SystemTime::now());

        let threshold_hit = entry.status.error_count >= self.config.max_error_count;

        if error.should_switch_credential() || threshold_hit {
            let exponent = entry.status.consecutive_quarantines.min(16);
            let cooldown = self
                .config
                .quarantine_base
                .saturating_mul(1 << exponent)
                .min(self.config.quarantine_cap);

            entry.status.quarantined_until = Some(Instant::now() + cooldown);
            entry.status.consecutive_quarantines += 1;

            log::warn!(
                "Credential {} quarantined for {cooldown:?} (provider '{provider}'): {error}",
                entry.credential.display_name(),
                provider = credential.provider,
            );
        } else {
            log::warn!(
                "Credential {} error {count}/{max} (provider '{provider}'): {error}",
                entry.credential.display_name(),
                count = entry.status.error_count,
                max = self.config.max_error_count,
                provider = credential.provider,
            );
        }
    }

    /// Record a failed token refresh. Counts toward the error threshold but
    /// never quarantines by itself; a subsequent request failure will.
    pub async fn mark_refresh_failure(&self, credential: &Credential, message: &str) {
        let Some(pool) = self.providers.get(&credential.provider) else {
            return;
        };
        let mut pool = pool.lock().await;

        if let Some(entry) = pool.entries.iter_mut().find(|e| e.credential.uuid == credential.uuid) {
            entry.status.error_count += 1;
            entry.status.last_error_msg = Some(message.to_string());
            entry.status.last_error_at = Some(SystemTime::now());
        }
    }

    /// Clear a quarantine by hand (the admin surface).
    pub async fn clear_quarantine(&self, uuid: Uuid) -> bool {
        for pool in self.providers.values() {
            let mut pool = pool.lock().await;

            if let Some(entry) = pool.entries.iter_mut().find(|e| e.credential.uuid == uuid) {
                entry.status.quarantined_until = None;
                entry.status.error_count = 0;
                entry.status.consecutive_quarantines = 0;
                log::info!("Credential {} quarantine cleared", entry.credential.display_name());
                return true;
            }
        }

        false
    }

    /// Every credential across all providers.
    pub async fn all_credentials(&self) -> Vec<Arc<Credential>> {
        let mut credentials = Vec::new();

        for pool in self.providers.values() {
            let pool = pool.lock().await;
            credentials.extend(pool.entries.iter().map(|e| e.credential.clone()));
        }

        credentials
    }

    /// Credentials whose token expiry is inside the skew window.
    pub async fn near_expiry(&self, skew: Duration) -> Vec<Arc<Credential>> {
        self.all_credentials()
            .await
            .into_iter()
            .filter(|c| c.is_expiry_near(skew))
            .collect()
    }

    /// Read-only snapshot for the admin surface.
    pub async fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        let mut snapshots = Vec::new();

        for pool in self.providers.values() {
            let pool = pool.lock().await;

            for entry in &pool.entries {
                snapshots.push(CredentialSnapshot {
                    uuid: entry.credential.uuid,
                    provider: entry.credential.provider,
                    custom_name: entry.credential.custom_name.clone(),
                    disabled: entry.credential.is_disabled(),
                    quarantined: entry.status.quarantined_until.is_some_and(|until| until > now),
                    error_count: entry.status.error_count,
                    last_error_msg: entry.status.last_error_msg.clone(),
                    last_error_at: entry.status.last_error_at,
                    in_flight: entry.credential.in_flight(),
                });
            }
        }

        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credential::SecretMaterial;
    use secrecy::SecretString;

    fn credential(provider: ProviderKind, name: &str) -> Arc<Credential> {
        Arc::new(Credential::new(
            Uuid::new_v4(),
            provider,
            Some(name.to_string()),
            None,
            false,
            SecretMaterial::ApiKey {
                key: SecretString::from("sk-test".to_string()),
            },
        ))
    }

    fn pool_with(
        credentials: Vec<Arc<Credential>>,
        fallbacks: HashMap<ProviderKind, Vec<FallbackRule>>,
        config: PoolConfig,
    ) -> CredentialPool {
        CredentialPool::new(credentials, fallbacks, config)
    }

    #[tokio::test]
    async fn selection_rotates_least_recently_used() {
        let a = credential(ProviderKind::Openai, "a");
        let b = credential(ProviderKind::Openai, "b");
        let pool = pool_with(
            vec![a.clone(), b.clone()],
            HashMap::new(),
            PoolConfig::default(),
        );

        let first = pool
            .acquire(ProviderKind::Openai, "gpt-4o", SelectOptions::default())
            .await
            .unwrap();
        let second = pool
            .acquire(ProviderKind::Openai, "gpt-4o", SelectOptions::default())
            .await
            .unwrap();

        assert_ne!(first.credential.uuid, second.credential.uuid);
    }

    #[tokio::test]
    async fn skip_usage_count_keeps_order() {
        let a = credential(ProviderKind::Openai, "a");
        let b = credential(ProviderKind::Openai, "b");
        let pool = pool_with(vec![a.clone(), b], HashMap::new(), PoolConfig::default());

        let options = SelectOptions {
            skip_usage_count: true,
            acquire_slot: false,
        };

        let first = pool.acquire(ProviderKind::Openai, "m", options).await.unwrap();
        let second = pool.acquire(ProviderKind::Openai, "m", options).await.unwrap();

        // Without usage counting the same credential stays first in line.
        assert_eq!(first.credential.uuid, second.credential.uuid);
    }

    #[tokio::test]
    async fn auth_failure_quarantines_immediately() {
        let a = credential(ProviderKind::Openai, "a");
        let b = credential(ProviderKind::Openai, "b");
        let pool = pool_with(
            vec![a.clone(), b.clone()],
            HashMap::new(),
            PoolConfig::default(),
        );

        pool.mark_failure(&a, &GatewayError::AuthenticationFailed("bad token".into()))
            .await;

        // Only b remains eligible, repeatedly.
        for _ in 0..3 {
            let acquired = pool
                .acquire(ProviderKind::Openai, "m", SelectOptions::default())
                .await
                .unwrap();
            assert_eq!(acquired.credential.uuid, b.uuid);
        }

        let snapshot = pool.snapshot().await;
        let a_snapshot = snapshot.iter().find(|s| s.uuid == a.uuid).unwrap();
        assert!(a_snapshot.quarantined);
    }

    #[tokio::test]
    async fn transient_errors_quarantine_at_threshold() {
        let a = credential(ProviderKind::Openai, "a");
        let pool = pool_with(vec![a.clone()], HashMap::new(), PoolConfig::default());

        for _ in 0..2 {
            pool.mark_failure(&a, &GatewayError::ConnectionError("reset".into())).await;
            assert!(
                pool.acquire(ProviderKind::Openai, "m", SelectOptions::default())
                    .await
                    .is_ok()
            );
        }

        pool.mark_failure(&a, &GatewayError::ConnectionError("reset".into())).await;

        let error = pool
            .acquire(ProviderKind::Openai, "m", SelectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, GatewayError::NoHealthyCredential { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_cooldown_elapses() {
        let a = credential(ProviderKind::Openai, "a");
        let pool = pool_with(vec![a.clone()], HashMap::new(), PoolConfig::default());

        pool.mark_failure(&a, &GatewayError::AuthenticationFailed("bad".into()))
            .await;
        assert!(
            pool.acquire(ProviderKind::Openai, "m", SelectOptions::default())
                .await
                .is_err()
        );

        // First quarantine lasts the base cooldown.
        tokio::time::advance(Duration::from_secs(2)).await;

        let acquired = pool
            .acquire(ProviderKind::Openai, "m", SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(acquired.credential.uuid, a.uuid);
    }

    #[tokio::test]
    async fn success_resets_error_count() {
        let a = credential(ProviderKind::Openai, "a");
        let pool = pool_with(vec![a.clone()], HashMap::new(), PoolConfig::default());

        pool.mark_failure(&a, &GatewayError::ConnectionError("reset".into())).await;
        pool.mark_failure(&a, &GatewayError::ConnectionError("reset".into())).await;
        pool.mark_success(&a).await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].error_count, 0);
        assert!(snapshot[0].last_error_msg.is_none());
    }

    #[tokio::test]
    async fn fallback_chain_rewrites_the_model() {
        let gemini = credential(ProviderKind::Gemini, "g");
        let fallbacks = HashMap::from([(
            ProviderKind::Anthropic,
            vec![FallbackRule {
                provider: ProviderKind::Gemini,
                model: Some("gemini-2.0-flash".to_string()),
            }],
        )]);

        let pool = pool_with(vec![gemini.clone()], fallbacks, PoolConfig::default());

        let acquired = pool
            .acquire(ProviderKind::Anthropic, "claude-sonnet-4", SelectOptions::default())
            .await
            .unwrap();

        assert!(acquired.is_fallback);
        assert_eq!(acquired.provider, ProviderKind::Gemini);
        assert_eq!(acquired.model, "gemini-2.0-flash");
    }

    #[tokio::test]
    async fn slot_capacity_one_never_double_selects() {
        let a = credential(ProviderKind::Openai, "a");
        let config = PoolConfig {
            slots_per_credential: 1,
            ..PoolConfig::default()
        };
        let pool = pool_with(vec![a.clone()], HashMap::new(), config);

        let options = SelectOptions {
            skip_usage_count: false,
            acquire_slot: true,
        };

        let first = pool.acquire(ProviderKind::Openai, "m", options).await.unwrap();
        // The only slot is taken; a concurrent selection must not pin it again.
        assert!(pool.acquire(ProviderKind::Openai, "m", options).await.is_err());

        drop(first);
        assert!(pool.acquire(ProviderKind::Openai, "m", options).await.is_ok());
    }

    #[tokio::test]
    async fn admin_clear_quarantine_restores_eligibility() {
        let a = credential(ProviderKind::Openai, "a");
        let pool = pool_with(vec![a.clone()], HashMap::new(), PoolConfig::default());

        pool.mark_failure(&a, &GatewayError::AuthenticationFailed("bad".into()))
            .await;
        assert!(
            pool.acquire(ProviderKind::Openai, "m", SelectOptions::default())
                .await
                .is_err()
        );

        assert!(pool.clear_quarantine(a.uuid).await);
        assert!(
            pool.acquire(ProviderKind::Openai, "m", SelectOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn disabled_credentials_are_never_selected() {
        let a = credential(ProviderKind::Openai, "a");
        let pool = pool_with(vec![a.clone()], HashMap::new(), PoolConfig::default());

        a.set_disabled(true);
        assert!(
            pool.acquire(ProviderKind::Openai, "m", SelectOptions::default())
                .await
                .is_err()
        );

        a.set_disabled(false);
        assert!(
            pool.acquire(ProviderKind::Openai, "m", SelectOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn model_declarations_filter_credentials() {
        use std::collections::BTreeSet;

        let restricted = Arc::new(Credential::new(
            Uuid::new_v4(),
            ProviderKind::Openai,
            Some("restricted".to_string()),
            Some(BTreeSet::from(["gpt-4o".to_string()])),
            false,
            SecretMaterial::ApiKey {
                key: SecretString::from("sk".to_string()),
            },
        ));

        let pool = pool_with(vec![restricted], HashMap::new(), PoolConfig::default());

        assert!(
            pool.acquire(ProviderKind::Openai, "gpt-4o", SelectOptions::default())
                .await
                .is_ok()
        );
        assert!(
            pool.acquire(ProviderKind::Openai, "o3-mini", SelectOptions::default())
                .await
                .is_err()
        );
    }
}
