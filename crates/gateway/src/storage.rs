//! Persisted state: the credential store document and the usage cache.
//!
//! Credentials are only ever created here, at load time; the request path
//! never mints one. The usage cache is advisory and written atomically
//! (temp-then-rename) under a per-file mutex.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use config::ProviderKind;
use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::pool::credential::{Credential, SecretMaterial};

/// One credential record in the store document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CredentialRecord {
    /// Stable identity.
    pub uuid: Uuid,
    /// Operator-facing label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    /// Administratively disabled.
    #[serde(default)]
    pub is_disabled: bool,
    /// Declared supported models; absent means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<BTreeSet<String>>,
    /// The secret material.
    #[serde(flatten)]
    pub secret: SecretRecord,
}

/// Secret material variants as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum SecretRecord {
    /// Static API key.
    ApiKey {
        /// The key.
        api_key: String,
    },
    /// OAuth token set.
    Oauth {
        /// Current access token.
        access_token: String,
        /// Long-lived refresh token.
        refresh_token: String,
        /// Access token expiry as unix seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<u64>,
    },
    /// Web-chat session cookie pair.
    Cookies {
        /// Session cookie.
        sso: String,
        /// Companion signature cookie.
        sso_rw: String,
    },
}

impl From<SecretRecord> for SecretMaterial {
    fn from(record: SecretRecord) -> Self {
        match record {
            SecretRecord::ApiKey { api_key } => SecretMaterial::ApiKey {
                key: SecretString::from(api_key),
            },
            SecretRecord::Oauth {
                access_token,
                refresh_token,
                expires_at,
            } => SecretMaterial::OAuth {
                access_token: SecretString::from(access_token),
                refresh_token: SecretString::from(refresh_token),
                expires_at: expires_at.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
            },
            SecretRecord::Cookies { sso, sso_rw } => SecretMaterial::Cookies {
                sso: SecretString::from(sso),
                sso_rw: SecretString::from(sso_rw),
            },
        }
    }
}

/// Load the credential store: a JSON document keyed by provider kind, each
/// value an array of credential records.
pub(crate) fn load_credentials(path: &Path) -> anyhow::Result<Vec<Arc<Credential>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credential store at {}", path.display()))?;

    let document: IndexMap<ProviderKind, Vec<CredentialRecord>> =
        serde_json::from_str(&content).context("credential store is not valid JSON")?;

    let mut credentials = Vec::new();

    for (provider, records) in document {
        for record in records {
            credentials.push(Arc::new(Credential::new(
                record.uuid,
                provider,
                record.custom_name,
                record.models,
                record.is_disabled,
                record.secret.into(),
            )));
        }
    }

    log::info!("Loaded {} credential(s) from {}", credentials.len(), path.display());

    Ok(credentials)
}

/// The advisory usage cache document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UsageCacheDocument {
    /// Unix seconds of the last write.
    pub timestamp: u64,
    /// Per-provider usage payloads, opaque to the gateway.
    pub providers: IndexMap<String, serde_json::Value>,
}

/// Writer for the usage cache: temp-then-rename under a per-file mutex.
pub(crate) struct UsageCacheWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UsageCacheWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn write(&self, providers: IndexMap<String, serde_json::Value>) -> anyhow::Result<()> {
        let document = UsageCacheDocument {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            providers,
        };

        let content = serde_json::to_vec_pretty(&document)?;

        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let temp_path = self.path.with_extension("json.tmp");

        tokio::fs::write(&temp_path, &content)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("failed to move usage cache into place at {}", self.path.display()))?;

        Ok(())
    }

    pub async fn read(&self) -> anyhow::Result<Option<UsageCacheDocument>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;

    #[test]
    fn loads_credentials_keyed_by_provider() {
        let document = json!({
            "openai": [
                {"uuid": "00000000-0000-0000-0000-000000000001", "kind": "api_key", "api_key": "sk-1"}
            ],
            "anthropic": [
                {
                    "uuid": "00000000-0000-0000-0000-000000000002",
                    "customName": "work account",
                    "kind": "oauth",
                    "access_token": "at",
                    "refresh_token": "rt",
                    "expires_at": 4102444800u64
                }
            ],
            "grok": [
                {
                    "uuid": "00000000-0000-0000-0000-000000000003",
                    "isDisabled": true,
                    "kind": "cookies",
                    "sso": "cookie-a",
                    "sso_rw": "cookie-b"
                }
            ]
        });

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_vec(&document).unwrap()).unwrap();

        let credentials = load_credentials(file.path()).unwrap();
        assert_eq!(credentials.len(), 3);

        let openai = credentials.iter().find(|c| c.provider == ProviderKind::Openai).unwrap();
        assert_eq!(openai.access_secret().expose_secret(), "sk-1");

        let anthropic = credentials
            .iter()
            .find(|c| c.provider == ProviderKind::Anthropic)
            .unwrap();
        assert_eq!(anthropic.custom_name.as_deref(), Some("work account"));
        assert!(anthropic.refresh_token().is_some());
        assert!(anthropic.token_expiry().is_some());

        let grok = credentials.iter().find(|c| c.provider == ProviderKind::Grok).unwrap();
        assert!(grok.is_disabled());
        assert!(grok.cookie_pair().is_some());
    }

    #[tokio::test]
    async fn usage_cache_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let writer = UsageCacheWriter::new(path.clone());

        let mut providers = IndexMap::new();
        providers.insert("grok".to_string(), json!({"remainingQueries": 62}));

        writer.write(providers).await.unwrap();

        let document = writer.read().await.unwrap().unwrap();
        assert!(document.timestamp > 0);
        assert_eq!(document.providers["grok"]["remainingQueries"], 62);

        // The temp file never survives the rename.
        assert!(!path.with_extension("json.tmp").exists());
    }
}
