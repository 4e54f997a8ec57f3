//! A single credential: one set of secret materials at one upstream provider.

use std::collections::BTreeSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use config::ProviderKind;
use secrecy::SecretString;
use uuid::Uuid;

/// Secret materials backing a credential.
pub(crate) enum SecretMaterial {
    /// A static API key.
    ApiKey {
        /// The key.
        key: SecretString,
    },
    /// OAuth tokens with a refreshable access token.
    OAuth {
        /// Current access token.
        access_token: SecretString,
        /// Long-lived refresh token.
        refresh_token: SecretString,
        /// Expiry of the access token.
        expires_at: Option<SystemTime>,
    },
    /// Web-chat session cookies (the Grok backend).
    Cookies {
        /// Session cookie value.
        sso: SecretString,
        /// Companion signature cookie.
        sso_rw: SecretString,
    },
}

/// Advisory usage snapshot, refreshed on a schedule and on demand.
#[derive(Debug, Clone)]
pub(crate) struct UsageSnapshot {
    /// Queries remaining in the current window.
    pub remaining_queries: u32,
    /// Total queries per window.
    pub total_queries: u32,
    /// When the snapshot was taken.
    pub refreshed_at: SystemTime,
}

/// One credential. Identity and secret material live here; health and usage
/// ordering state is owned by the provider pool and mutated under its lock.
pub(crate) struct Credential {
    /// Stable identity used by logs and pool operations.
    pub uuid: Uuid,
    /// Provider this credential belongs to.
    pub provider: ProviderKind,
    /// Operator-facing label.
    pub custom_name: Option<String>,
    /// Models this credential declares support for; `None` means all.
    pub models: Option<BTreeSet<String>>,
    /// Administratively disabled credentials are never selected.
    disabled: AtomicBool,
    secret: RwLock<SecretMaterial>,
    usage: RwLock<Option<UsageSnapshot>>,
    in_flight: AtomicU32,
}

impl Credential {
    pub fn new(
        uuid: Uuid,
        provider: ProviderKind,
        custom_name: Option<String>,
        models: Option<BTreeSet<String>>,
        disabled: bool,
        secret: SecretMaterial,
    ) -> Self {
        Self {
            uuid,
            provider,
            custom_name,
            models,
            disabled: AtomicBool::new(disabled),
            secret: RwLock::new(secret),
            usage: RwLock::new(None),
            in_flight: AtomicU32::new(0),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// Whether this credential declares support for the model.
    pub fn supports_model(&self, model: &str) -> bool {
        match &self.models {
            Some(models) => models.contains(model),
            None => true,
        }
    }

    /// The secret presented to the upstream: API key, access token or the
    /// primary session cookie.
    pub fn access_secret(&self) -> SecretString {
        let secret = self.secret.read().unwrap_or_else(|e| e.into_inner());

        match &*secret {
            SecretMaterial::ApiKey { key } => key.clone(),
            SecretMaterial::OAuth { access_token, .. } => access_token.clone(),
            SecretMaterial::Cookies { sso, .. } => sso.clone(),
        }
    }

    /// The refresh token, for OAuth credentials.
    pub fn refresh_token(&self) -> Option<SecretString> {
        let secret = self.secret.read().unwrap_or_else(|e| e.into_inner());

        match &*secret {
            SecretMaterial::OAuth { refresh_token, .. } => Some(refresh_token.clone()),
            _ => None,
        }
    }

    /// The cookie pair, for web-chat credentials.
    pub fn cookie_pair(&self) -> Option<(SecretString, SecretString)> {
        let secret = self.secret.read().unwrap_or_else(|e| e.into_inner());

        match &*secret {
            SecretMaterial::Cookies { sso, sso_rw } => Some((sso.clone(), sso_rw.clone())),
            _ => None,
        }
    }

    /// Expiry of the access token, when the material has one.
    pub fn token_expiry(&self) -> Option<SystemTime> {
        let secret = self.secret.read().unwrap_or_else(|e| e.into_inner());

        match &*secret {
            SecretMaterial::OAuth { expires_at, .. } => *expires_at,
            _ => None,
        }
    }

    /// `now + skew >= expiry`. Credentials without an expiry use their usage
    /// snapshot freshness window instead.
    pub fn is_expiry_near(&self, skew: Duration) -> bool {
        if let Some(expiry) = self.token_expiry() {
            return SystemTime::now() + skew >= expiry;
        }

        // Snapshot-freshness window for materials without a real expiry.
        if let Some(snapshot) = self.usage_snapshot() {
            return SystemTime::now() >= snapshot.refreshed_at + skew;
        }

        false
    }

    /// Install a freshly refreshed access token.
    pub fn install_access_token(&self, access_token: SecretString, expires_at: Option<SystemTime>) {
        let mut secret = self.secret.write().unwrap_or_else(|e| e.into_inner());

        if let SecretMaterial::OAuth {
            access_token: current,
            expires_at: current_expiry,
            ..
        } = &mut *secret
        {
            *current = access_token;
            *current_expiry = expires_at;
        }
    }

    pub fn usage_snapshot(&self) -> Option<UsageSnapshot> {
        self.usage.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_usage_snapshot(&self, snapshot: UsageSnapshot) {
        *self.usage.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    /// Reserve a concurrency slot; pairs with [`SlotGuard`] release.
    pub(super) fn try_acquire_slot(&self, capacity: u32) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .is_ok()
    }

    pub(super) fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Log-friendly identity: custom name when present, uuid otherwise.
    pub fn display_name(&self) -> String {
        match &self.custom_name {
            Some(name) => format!("{name} ({})", self.uuid),
            None => self.uuid.to_string(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("uuid", &self.uuid)
            .field("provider", &self.provider)
            .field("custom_name", &self.custom_name)
            .field("disabled", &self.is_disabled())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_credential(expires_at: Option<SystemTime>) -> Credential {
        Credential::new(
            Uuid::new_v4(),
            ProviderKind::Openai,
            None,
            None,
            false,
            SecretMaterial::OAuth {
                access_token: SecretString::from("at".to_string()),
                refresh_token: SecretString::from("rt".to_string()),
                expires_at,
            },
        )
    }

    #[test]
    fn expiry_near_within_skew() {
        let soon = SystemTime::now() + Duration::from_secs(60);
        let credential = oauth_credential(Some(soon));

        assert!(credential.is_expiry_near(Duration::from_secs(300)));
        assert!(!credential.is_expiry_near(Duration::from_secs(10)));
    }

    #[test]
    fn api_keys_never_near_expiry() {
        let credential = Credential::new(
            Uuid::new_v4(),
            ProviderKind::Openai,
            None,
            None,
            false,
            SecretMaterial::ApiKey {
                key: SecretString::from("sk-test".to_string()),
            },
        );

        assert!(!credential.is_expiry_near(Duration::from_secs(3600)));
    }

    #[test]
    fn slot_capacity_is_enforced() {
        let credential = oauth_credential(None);

        assert!(credential.try_acquire_slot(2));
        assert!(credential.try_acquire_slot(2));
        assert!(!credential.try_acquire_slot(2));

        credential.release_slot();
        assert!(credential.try_acquire_slot(2));
    }

    #[test]
    fn installed_tokens_replace_the_old_ones() {
        use secrecy::ExposeSecret;

        let credential = oauth_credential(None);
        let expiry = SystemTime::now() + Duration::from_secs(3600);

        credential.install_access_token(SecretString::from("fresh".to_string()), Some(expiry));

        assert_eq!(credential.access_secret().expose_secret(), "fresh");
        assert_eq!(credential.token_expiry(), Some(expiry));
    }

    #[test]
    fn model_support_defaults_to_all() {
        let credential = oauth_credential(None);
        assert!(credential.supports_model("anything"));

        let restricted = Credential::new(
            Uuid::new_v4(),
            ProviderKind::Openai,
            None,
            Some(BTreeSet::from(["gpt-4o".to_string()])),
            false,
            SecretMaterial::ApiKey {
                key: SecretString::from("sk".to_string()),
            },
        );

        assert!(restricted.supports_model("gpt-4o"));
        assert!(!restricted.supports_model("gpt-3.5-turbo"));
    }
}
