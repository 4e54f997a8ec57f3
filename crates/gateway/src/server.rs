//! Request orchestration: provider routing, credential acquisition, retry
//! and failover, stream guarding and prefix-cache usage injection.

mod builder;

pub(crate) use builder::GatewayServerBuilder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::{ClientConfig, ProviderKind};
use futures::StreamExt;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::{
    error::{GatewayError, GatewayResult},
    messages::{
        Dialect,
        unified::{UnifiedChoiceDelta, UnifiedChunk, UnifiedMessageDelta, UnifiedModel, UnifiedRequest, UnifiedResponse},
    },
    pool::{Acquired, CredentialPool, SelectOptions},
    prefix_cache::PrefixCacheAccountant,
    provider::{Adapter, ChatStream, dropped_block_kinds},
    refresh::TokenRefresher,
    request::RequestContext,
    storage::UsageCacheWriter,
};

/// Model catalogue cache TTL.
const CATALOGUE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct CachedModels {
    models: Vec<UnifiedModel>,
    cached_at: Instant,
}

/// The gateway request-path runtime, shared by all handlers.
#[derive(Clone)]
pub(crate) struct GatewayServer {
    shared: Arc<GatewayServerInner>,
}

pub(crate) struct GatewayServerInner {
    pub(crate) adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
    pub(crate) pool: Arc<CredentialPool>,
    pub(crate) refresher: Arc<TokenRefresher>,
    pub(crate) accountant: PrefixCacheAccountant,
    pub(crate) usage_cache: Arc<UsageCacheWriter>,
    pub(crate) client_config: ClientConfig,
    catalogue: RwLock<Option<CachedModels>>,
}

impl GatewayServer {
    pub(crate) fn new(
        adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
        pool: Arc<CredentialPool>,
        refresher: Arc<TokenRefresher>,
        accountant: PrefixCacheAccountant,
        usage_cache: Arc<UsageCacheWriter>,
        client_config: ClientConfig,
    ) -> Self {
        Self {
            shared: Arc::new(GatewayServerInner {
                adapters,
                pool,
                refresher,
                accountant,
                usage_cache,
                client_config,
                catalogue: RwLock::new(None),
            }),
        }
    }

    /// Route a model name to its provider.
    ///
    /// An explicit `provider/model` prefix wins; otherwise the model name's
    /// family decides, and as a last resort the dialect's native provider.
    pub(crate) fn resolve_provider(&self, model: &str, dialect: Dialect) -> GatewayResult<(ProviderKind, String)> {
        if let Some((prefix, rest)) = model.split_once('/') {
            if rest.is_empty() {
                return Err(GatewayError::InvalidRequest(format!(
                    "Invalid model format: '{model}'"
                )));
            }

            let provider = match prefix {
                "openai" => ProviderKind::Openai,
                "anthropic" => ProviderKind::Anthropic,
                "gemini" | "google" => ProviderKind::Gemini,
                "grok" | "xai" => ProviderKind::Grok,
                other => return Err(GatewayError::ProviderNotFound(other.to_string())),
            };

            return Ok((provider, rest.to_string()));
        }

        let lowered = model.to_ascii_lowercase();

        let provider = if lowered.contains("claude") {
            ProviderKind::Anthropic
        } else if lowered.contains("gemini") {
            ProviderKind::Gemini
        } else if lowered.contains("grok") {
            ProviderKind::Grok
        } else if lowered.starts_with("gpt") || lowered.starts_with("o1") || lowered.starts_with("o3") || lowered.starts_with("o4") {
            ProviderKind::Openai
        } else {
            match dialect {
                Dialect::OpenAi => ProviderKind::Openai,
                Dialect::Anthropic => ProviderKind::Anthropic,
                Dialect::Gemini => ProviderKind::Gemini,
            }
        };

        Ok((provider, model.to_string()))
    }

    async fn acquire(&self, provider: ProviderKind, model: &str) -> GatewayResult<(Acquired, Arc<dyn Adapter>)> {
        let acquired = self
            .shared
            .pool
            .acquire(
                provider,
                model,
                SelectOptions {
                    skip_usage_count: false,
                    acquire_slot: true,
                },
            )
            .await?;

        let adapter = self
            .shared
            .adapters
            .get(&acquired.provider)
            .cloned()
            .ok_or_else(|| GatewayError::ProviderNotFound(acquired.provider.to_string()))?;

        if acquired.is_fallback {
            log::debug!(
                "Serving request through fallback provider '{}' with model '{}'",
                acquired.provider,
                acquired.model,
            );
        }

        // Proactive refresh keeps a soon-to-expire token out of the request.
        if self.shared.refresher.is_expiry_near(&acquired.credential) {
            if let Err(e) = self.shared.refresher.refresh(acquired.credential.clone()).await {
                log::debug!("Pre-request token refresh failed, proceeding with current token: {e}");
            }
        }

        Ok((acquired, adapter))
    }

    /// One-shot completion with bounded full-request retries.
    pub(crate) async fn completions(
        &self,
        mut request: UnifiedRequest,
        context: &RequestContext,
        dialect: Dialect,
    ) -> GatewayResult<UnifiedResponse> {
        // The header-supplied user id seeds the cache session when the body
        // carries none.
        if request.metadata.as_ref().and_then(|m| m.user_id.as_ref()).is_none()
            && let Some(user_id) = &context.user_id
        {
            request.metadata = Some(crate::messages::unified::UnifiedMetadata {
                user_id: Some(user_id.clone()),
            });
        }

        let (provider, routed_model) = self.resolve_provider(&request.model, dialect)?;

        let dropped = dropped_block_kinds(&request, provider);
        if !dropped.is_empty() {
            log::warn!("Dropping unsupported content parts for provider '{provider}': {dropped:?}");
        }

        let original_model = request.model.clone();
        let max_attempts = self.shared.client_config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (acquired, adapter) = self.acquire(provider, &routed_model).await?;

            let mut attempt_request = request.clone();
            attempt_request.model = acquired.model.clone();

            match adapter.generate(&acquired.credential, attempt_request).await {
                Ok(mut response) => {
                    self.shared.pool.mark_success(&acquired.credential).await;
                    response.model = original_model;

                    if dialect == Dialect::Anthropic {
                        self.inject_cache_accounting(&request, &mut response).await;
                    }

                    return Ok(response);
                }
                Err(error) => {
                    self.shared.pool.mark_failure(&acquired.credential, &error).await;

                    if attempt >= max_attempts || !error.is_retryable() {
                        return Err(error);
                    }

                    log::info!(
                        "Retrying request after attempt {attempt}/{max_attempts} failed on credential {}: {error}",
                        acquired.credential.display_name(),
                    );
                }
            }
        }
    }

    /// Streaming completion.
    ///
    /// Retries only until a stream is established; once chunks flow, errors
    /// end the stream without retry. The slot guard travels inside the
    /// returned stream, so client disconnects release it without marking the
    /// credential.
    pub(crate) async fn completions_stream(
        &self,
        request: UnifiedRequest,
        _context: &RequestContext,
        dialect: Dialect,
    ) -> GatewayResult<ChatStream> {
        let (provider, routed_model) = self.resolve_provider(&request.model, dialect)?;

        let dropped = dropped_block_kinds(&request, provider);
        if !dropped.is_empty() {
            log::warn!("Dropping unsupported content parts for provider '{provider}': {dropped:?}");
        }

        let original_model = request.model.clone();
        let max_attempts = self.shared.client_config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (acquired, adapter) = self.acquire(provider, &routed_model).await?;

            let mut attempt_request = request.clone();
            attempt_request.model = acquired.model.clone();
            attempt_request.stream = Some(true);

            match adapter.generate_stream(&acquired.credential, attempt_request).await {
                Ok(stream) => {
                    let warning = (!dropped.is_empty()).then(|| {
                        format!("Dropped content parts unsupported by this provider: {}", dropped.join(", "))
                    });

                    return Ok(self.guard_stream(stream, acquired, original_model, warning));
                }
                Err(error) => {
                    self.shared.pool.mark_failure(&acquired.credential, &error).await;

                    if attempt >= max_attempts || !error.is_retryable() {
                        return Err(error);
                    }

                    log::info!(
                        "Retrying stream open after attempt {attempt}/{max_attempts} failed on credential {}: {error}",
                        acquired.credential.display_name(),
                    );
                }
            }
        }
    }

    /// Wrap an upstream stream with the inter-event timeout, health marking
    /// and slot lifetime.
    fn guard_stream(
        &self,
        stream: ChatStream,
        acquired: Acquired,
        original_model: String,
        warning: Option<String>,
    ) -> ChatStream {
        struct GuardState {
            stream: ChatStream,
            acquired: Acquired,
            pool: Arc<CredentialPool>,
            model: String,
            idle_timeout: Duration,
            warning: Option<String>,
            role_sent: bool,
            done: bool,
        }

        let state = GuardState {
            stream,
            acquired,
            pool: self.shared.pool.clone(),
            model: original_model,
            idle_timeout: self.shared.client_config.stream_idle_timeout,
            warning,
            role_sent: false,
            done: false,
        };

        let guarded = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            // Trace for dropped multimodal parts, ahead of upstream chunks.
            if let Some(warning) = state.warning.take() {
                state.role_sent = true;

                let chunk = UnifiedChunk {
                    id: std::borrow::Cow::Borrowed(""),
                    model: std::borrow::Cow::Owned(state.model.clone()),
                    choices: vec![UnifiedChoiceDelta {
                        index: 0,
                        delta: UnifiedMessageDelta {
                            role: Some(crate::messages::unified::UnifiedRole::Assistant),
                            reasoning: Some(warning),
                            ..Default::default()
                        },
                        finish_reason: None,
                    }],
                    usage: None,
                    created: 0,
                };

                return Some((Ok(chunk), state));
            }

            match tokio::time::timeout(state.idle_timeout, state.stream.next()).await {
                Err(_) => {
                    let error = GatewayError::StreamTimeout;
                    state.pool.mark_failure(&state.acquired.credential, &error).await;
                    state.done = true;
                    state.acquired.slot = None;

                    Some((Err(error), state))
                }
                Ok(None) => {
                    state.pool.mark_success(&state.acquired.credential).await;
                    state.acquired.slot = None;
                    None
                }
                Ok(Some(Ok(mut chunk))) => {
                    chunk.model = std::borrow::Cow::Owned(state.model.clone());

                    // The role delta goes out exactly once per stream.
                    if state.role_sent {
                        for choice in &mut chunk.choices {
                            choice.delta.role = None;
                        }
                    } else if !chunk.choices.is_empty() {
                        for choice in &mut chunk.choices {
                            choice.delta.role = Some(crate::messages::unified::UnifiedRole::Assistant);
                        }
                        state.role_sent = true;
                    }

                    if chunk.is_terminal() {
                        state.pool.mark_success(&state.acquired.credential).await;
                        state.done = true;
                        state.acquired.slot = None;
                    }

                    Some((Ok(chunk), state))
                }
                Ok(Some(Err(error))) => {
                    state.pool.mark_failure(&state.acquired.credential, &error).await;
                    state.done = true;
                    state.acquired.slot = None;

                    Some((Err(error), state))
                }
            }
        });

        Box::pin(guarded)
    }

    /// Fill in the prompt-cache breakdown when the upstream did not report
    /// one itself.
    async fn inject_cache_accounting(&self, request: &UnifiedRequest, response: &mut UnifiedResponse) {
        if response.usage.cache_read_input_tokens.is_some() || response.usage.cache_creation_input_tokens.is_some() {
            return;
        }

        let accounting = self.shared.accountant.account(request).await;

        if accounting.cache_read_input_tokens == 0 && accounting.cache_creation_input_tokens == 0 {
            return;
        }

        response.usage.cache_read_input_tokens = Some(accounting.cache_read_input_tokens);
        response.usage.cache_creation_input_tokens = Some(accounting.cache_creation_input_tokens);
        // Anthropic semantics: input_tokens covers the uncached remainder.
        response.usage.prompt_tokens = accounting.uncached_input_tokens;
        response.usage.total_tokens = response.usage.prompt_tokens + response.usage.completion_tokens;
    }

    /// Count the input tokens of a request, preferring the provider's own
    /// counter and falling back to the local estimate.
    pub(crate) async fn count_tokens(&self, request: UnifiedRequest, dialect: Dialect) -> GatewayResult<u32> {
        let (provider, routed_model) = self.resolve_provider(&request.model, dialect)?;

        let selection = self
            .shared
            .pool
            .acquire(
                provider,
                &routed_model,
                SelectOptions {
                    skip_usage_count: true,
                    acquire_slot: false,
                },
            )
            .await;

        match selection {
            Ok(acquired) => {
                let Some(adapter) = self.shared.adapters.get(&acquired.provider) else {
                    return Ok(crate::token_counter::count_input_tokens(&request));
                };

                match adapter.count_tokens(&acquired.credential, &request).await {
                    Ok(count) => Ok(count),
                    Err(e) => {
                        log::debug!("Provider token count failed, using local estimate: {e}");
                        Ok(crate::token_counter::count_input_tokens(&request))
                    }
                }
            }
            Err(_) => Ok(crate::token_counter::count_input_tokens(&request)),
        }
    }

    /// The aggregated model catalogue, cached briefly.
    pub(crate) async fn models(&self) -> Vec<UnifiedModel> {
        {
            let cache = self.shared.catalogue.read().await;

            if let Some(cached) = cache.as_ref()
                && cached.cached_at.elapsed() < CATALOGUE_TTL
            {
                return cached.models.clone();
            }
        }

        let mut cache = self.shared.catalogue.write().await;

        // Another task may have refreshed while we waited for the write lock.
        if let Some(cached) = cache.as_ref()
            && cached.cached_at.elapsed() < CATALOGUE_TTL
        {
            return cached.models.clone();
        }

        let mut all_models = Vec::new();

        let mut fetches = self
            .shared
            .adapters
            .values()
            .map(|adapter| async move {
                let provider = adapter.provider();

                let selection = self
                    .shared
                    .pool
                    .acquire(
                        provider,
                        "",
                        SelectOptions {
                            skip_usage_count: true,
                            acquire_slot: false,
                        },
                    )
                    .await;

                match selection {
                    // A fallback credential belongs to another provider and
                    // cannot authenticate this adapter's catalogue call.
                    Ok(acquired) if acquired.provider == provider => {
                        (provider, adapter.list_models(&acquired.credential).await)
                    }
                    Ok(_) => (provider, Ok(Vec::new())),
                    Err(e) => (provider, Err(anyhow::anyhow!(e))),
                }
            })
            .collect::<futures::stream::FuturesUnordered<_>>();

        while let Some((provider, result)) = fetches.next().await {
            match result {
                Ok(models) => all_models.extend(models),
                Err(e) => log::warn!("Failed to fetch models for provider '{provider}': {e}"),
            }
        }
        drop(fetches);

        all_models.sort_by(|a, b| a.id.cmp(&b.id));
        all_models.dedup_by(|a, b| a.id == b.id);

        *cache = Some(CachedModels {
            models: all_models.clone(),
            cached_at: Instant::now(),
        });

        all_models
    }

    /// One usage sweep: refresh advisory snapshots and persist the document.
    pub(crate) async fn usage_sweep(&self) {
        let mut providers: IndexMap<String, serde_json::Value> = IndexMap::new();

        for credential in self.shared.pool.all_credentials().await {
            let Some(adapter) = self.shared.adapters.get(&credential.provider) else {
                continue;
            };

            match adapter.usage_limits(&credential).await {
                Ok(Some(snapshot)) => {
                    credential.set_usage_snapshot(snapshot.clone());

                    providers.insert(
                        format!("{}:{}", credential.provider, credential.uuid),
                        serde_json::json!({
                            "remainingQueries": snapshot.remaining_queries,
                            "totalQueries": snapshot.total_queries,
                        }),
                    );
                }
                Ok(None) => {}
                Err(e) => log::debug!(
                    "Usage snapshot refresh failed for credential {}: {e}",
                    credential.display_name()
                ),
            }
        }

        if providers.is_empty() {
            return;
        }

        if let Err(e) = self.shared.usage_cache.write(providers).await {
            log::warn!("Failed to persist usage cache: {e}");
        }
    }
}
