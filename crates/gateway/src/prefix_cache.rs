//! Prefix-cache accounting for the Anthropic dialect.
//!
//! When the upstream does not itself report prompt caching, this module
//! computes the `cache_read` / `cache_creation` / `uncached` breakdown from
//! cumulative hashes over the prompt prefix, backed by an external key-value
//! store. The store is strictly best-effort: any failure degrades to "all
//! uncached" and never reaches the request path.

pub(crate) mod hasher;

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::messages::unified::{SystemContent, UnifiedContent, UnifiedContentContainer, UnifiedRequest};
use crate::token_counter;
use hasher::{CumulativeHasher, canonical_json};

/// System entries carrying this sentinel are injected billing headers; they
/// must not poison the cached prefix.
const BILLING_HEADER_SENTINEL: &str = "x-relay-billing";

/// Store retry bounds: lazy connect with linear backoff.
const STORE_MAX_ATTEMPTS: u32 = 3;
const STORE_BACKOFF_STEP: Duration = Duration::from_millis(200);
const STORE_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// A prompt-cache boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Breakpoint {
    /// Cumulative hash of the prefix up to and including the marked block.
    pub hash: String,
    /// Running token count at this boundary.
    pub cumulative_tokens: u32,
    /// TTL in seconds from the marker.
    pub ttl: u64,
}

/// The accounted breakdown reported in the response usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheAccounting {
    pub cache_read_input_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub uncached_input_tokens: u32,
}

impl CacheAccounting {
    fn all_uncached(total: u32) -> Self {
        Self {
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
            uncached_input_tokens: total,
        }
    }
}

/// Compute the breakpoints of a request.
///
/// Feed order is fixed: tools sorted by name, system content, then message
/// blocks. A breakpoint is emitted at, and only at, blocks carrying a
/// `cache_control` marker, with the marker itself stripped from the hashed
/// serialisation. Blocks after the last marker are not fed, so the cached
/// prefix's identity is independent of the uncached suffix.
pub(crate) fn compute_breakpoints(request: &UnifiedRequest) -> Vec<Breakpoint> {
    let mut hasher = CumulativeHasher::new();
    let mut breakpoints = Vec::new();

    if let Some(tools) = &request.tools {
        let mut sorted: Vec<_> = tools.iter().collect();
        sorted.sort_by(|a, b| a.function.name.cmp(&b.function.name));

        for tool in sorted {
            hasher.feed(&format!(
                "name:{name}|desc:{desc}|schema:{schema}",
                name = tool.function.name,
                desc = tool.function.description.as_deref().unwrap_or(""),
                schema = canonical_json(&tool.function.parameters),
            ));
        }
    }

    // Positions of cache markers, so feeding can stop at the last one.
    let mut marked_system = Vec::new();
    let mut system_blocks: &[crate::messages::unified::SystemBlock] = &[];

    if let Some(SystemContent::Blocks(blocks)) = &request.system {
        system_blocks = blocks;

        for (i, block) in blocks.iter().enumerate() {
            if block.cache_control.is_some() {
                marked_system.push(i);
            }
        }
    }

    let mut marked_messages = Vec::new();
    for (m, message) in request.messages.iter().enumerate() {
        if let UnifiedContentContainer::Blocks(blocks) = &message.content {
            for (b, block) in blocks.iter().enumerate() {
                if block.cache_control().is_some() {
                    marked_messages.push((m, b));
                }
            }
        }
    }

    let last_marked_message = marked_messages.last().copied();
    let last_marked_system = marked_system.last().copied();

    if last_marked_message.is_none() && last_marked_system.is_none() {
        return breakpoints;
    }

    // System content, in order, as plain text. Sentinel entries are skipped.
    match &request.system {
        Some(SystemContent::Text(text)) => {
            if !text.contains(BILLING_HEADER_SENTINEL) {
                hasher.feed(text);
            }
        }
        Some(SystemContent::Blocks(_)) => {
            for (i, block) in system_blocks.iter().enumerate() {
                if block.text.contains(BILLING_HEADER_SENTINEL) {
                    continue;
                }

                hasher.feed(&block.text);

                if block.cache_control.is_some() {
                    let (hash, cumulative_tokens) = hasher.snapshot();
                    breakpoints.push(Breakpoint {
                        hash,
                        cumulative_tokens,
                        ttl: block.cache_control.as_ref().map(|c| c.ttl_seconds()).unwrap_or(300),
                    });
                }

                // System feeding ends early only when nothing later is marked.
                if last_marked_message.is_none() && Some(i) == last_marked_system {
                    return breakpoints;
                }
            }
        }
        None => {}
    }

    let Some((last_m, last_b)) = last_marked_message else {
        return breakpoints;
    };

    for (m, message) in request.messages.iter().enumerate() {
        let UnifiedContentContainer::Blocks(blocks) = &message.content else {
            // Unmarked plain-text messages are part of the prefix as long as
            // a later block is marked.
            if m <= last_m {
                hasher.feed(&message.content.visible_text());
            }
            continue;
        };

        for (b, block) in blocks.iter().enumerate() {
            hasher.feed(&serialized_without_marker(block));

            if block.cache_control().is_some() {
                let (hash, cumulative_tokens) = hasher.snapshot();
                breakpoints.push(Breakpoint {
                    hash,
                    cumulative_tokens,
                    ttl: block.cache_control().map(|c| c.ttl_seconds()).unwrap_or(300),
                });
            }

            if (m, b) == (last_m, last_b) {
                return breakpoints;
            }
        }
    }

    breakpoints
}

/// Canonical JSON of a block with its `cache_control` field stripped, so the
/// marker itself does not alter the hash.
fn serialized_without_marker(block: &UnifiedContent) -> String {
    let mut value = serde_json::to_value(block).unwrap_or_default();

    if let Some(obj) = value.as_object_mut() {
        obj.remove("cache_control");
    }

    canonical_json(&value)
}

/// Derive the cache session from the caller-supplied user id: an embedded
/// `…_session_<UUID>…` wins, anything else hashes.
pub(crate) fn session_id(user_id: &str) -> String {
    static SESSION_UUID: OnceLock<Regex> = OnceLock::new();

    let regex = SESSION_UUID.get_or_init(|| {
        Regex::new(r"_session_([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})")
            .expect("session pattern is valid")
    });

    if let Some(captures) = regex.captures(user_id) {
        return captures[1].to_string();
    }

    format!("{:x}", Sha256::digest(user_id.as_bytes()))
}

/// The key-value store behind the accountant.
#[async_trait]
pub(crate) trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<u32>>;
    async fn set_ex(&self, key: &str, value: u32, ttl_seconds: u64) -> anyhow::Result<()>;
    async fn expire(&self, key: &str, ttl_seconds: u64) -> anyhow::Result<()>;
}

/// Redis-backed store with lazy connect and bounded retry.
pub(crate) struct RedisStore {
    url: String,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    pub fn new(url: String) -> Self {
        Self {
            url,
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> anyhow::Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let client = redis::Client::open(self.url.as_str())?;
        let mut last_error = None;

        for attempt in 1..=STORE_MAX_ATTEMPTS {
            match ConnectionManager::new(client.clone()).await {
                Ok(connection) => {
                    *guard = Some(connection.clone());
                    return Ok(connection);
                }
                Err(e) => {
                    let backoff = (STORE_BACKOFF_STEP * attempt).min(STORE_BACKOFF_CAP);
                    log::warn!(
                        "Prefix-cache store connect attempt {attempt}/{STORE_MAX_ATTEMPTS} failed: {e}, retrying in {backoff:?}"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(last_error.expect("at least one attempt ran").into())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<u32>> {
        let mut connection = self.connection().await?;
        Ok(redis::cmd("GET").arg(key).query_async(&mut connection).await?)
    }

    async fn set_ex(&self, key: &str, value: u32, ttl_seconds: u64) -> anyhow::Result<()> {
        let mut connection = self.connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> anyhow::Result<()> {
        let mut connection = self.connection().await?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }
}

/// The accountant: breakpoints against the store, fail-open.
pub(crate) struct PrefixCacheAccountant {
    store: Option<Box<dyn CacheStore>>,
}

impl PrefixCacheAccountant {
    pub fn new(config: &config::PrefixCacheConfig) -> Self {
        let store: Option<Box<dyn CacheStore>> = match (&config.enabled, &config.url) {
            (true, Some(url)) => Some(Box::new(RedisStore::new(url.to_string()))),
            _ => None,
        };

        Self { store }
    }

    #[cfg(test)]
    pub fn with_store(store: Box<dyn CacheStore>) -> Self {
        Self { store: Some(store) }
    }

    /// Account one request: the breakdown the caller expects in usage.
    pub async fn account(&self, request: &UnifiedRequest) -> CacheAccounting {
        let total = token_counter::count_input_tokens(request);

        let Some(store) = &self.store else {
            return CacheAccounting::all_uncached(total);
        };

        let breakpoints = compute_breakpoints(request);

        if breakpoints.is_empty() {
            return CacheAccounting::all_uncached(total);
        }

        let user_id = request
            .metadata
            .as_ref()
            .and_then(|m| m.user_id.as_deref())
            .unwrap_or_default();
        let session = session_id(user_id);

        match lookup_create(store.as_ref(), &session, &breakpoints, total).await {
            Ok(accounting) => accounting,
            Err(e) => {
                log::warn!("Prefix-cache store unavailable, reporting all tokens uncached: {e}");
                CacheAccounting::all_uncached(total)
            }
        }
    }
}

async fn lookup_create(
    store: &dyn CacheStore,
    session: &str,
    breakpoints: &[Breakpoint],
    total: u32,
) -> anyhow::Result<CacheAccounting> {
    let mut cache_read = 0;
    let mut hit_index = None;

    // Deepest surviving prefix wins.
    for (index, breakpoint) in breakpoints.iter().enumerate().rev() {
        let key = format!("cache:{session}:{hash}", hash = breakpoint.hash);

        if let Some(stored) = store.get(&key).await? {
            cache_read = stored;
            store.expire(&key, breakpoint.ttl).await?;
            hit_index = Some(index);
            break;
        }
    }

    let start = hit_index.map(|i| i + 1).unwrap_or(0);
    let mut previous_tokens = hit_index.map(|i| breakpoints[i].cumulative_tokens).unwrap_or(0);
    let mut cache_creation = 0;

    for breakpoint in &breakpoints[start..] {
        let key = format!("cache:{session}:{hash}", hash = breakpoint.hash);
        store.set_ex(&key, breakpoint.cumulative_tokens, breakpoint.ttl).await?;

        cache_creation += breakpoint.cumulative_tokens.saturating_sub(previous_tokens);
        previous_tokens = breakpoint.cumulative_tokens;
    }

    Ok(CacheAccounting {
        cache_read_input_tokens: cache_read,
        cache_creation_input_tokens: cache_creation,
        uncached_input_tokens: total.saturating_sub(cache_read + cache_creation),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{
        CacheControl, CacheTtl, UnifiedContent, UnifiedMessage, UnifiedRole,
    };
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStore {
        entries: StdMutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl CacheStore for MemoryStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<u32>> {
            Ok(self.entries.lock().unwrap().get(key).copied())
        }

        async fn set_ex(&self, key: &str, value: u32, _ttl_seconds: u64) -> anyhow::Result<()> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn expire(&self, _key: &str, _ttl_seconds: u64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<u32>> {
            anyhow::bail!("store is down")
        }

        async fn set_ex(&self, _key: &str, _value: u32, _ttl_seconds: u64) -> anyhow::Result<()> {
            anyhow::bail!("store is down")
        }

        async fn expire(&self, _key: &str, _ttl_seconds: u64) -> anyhow::Result<()> {
            anyhow::bail!("store is down")
        }
    }

    fn request_with_blocks(blocks: Vec<UnifiedContent>, user_id: &str) -> UnifiedRequest {
        UnifiedRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContentContainer::Blocks(blocks),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            system: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            metadata: Some(crate::messages::unified::UnifiedMetadata {
                user_id: Some(user_id.to_string()),
            }),
            extra: serde_json::Map::new(),
        }
    }

    fn marked_text(text: &str, ttl: Option<CacheTtl>) -> UnifiedContent {
        UnifiedContent::Text {
            text: text.to_string(),
            cache_control: Some(CacheControl::Ephemeral { ttl }),
        }
    }

    fn plain_text(text: &str) -> UnifiedContent {
        UnifiedContent::Text {
            text: text.to_string(),
            cache_control: None,
        }
    }

    #[test]
    fn breakpoint_is_independent_of_the_suffix() {
        let a = request_with_blocks(vec![marked_text("prefix", None), plain_text("tail-A")], "u");
        let b = request_with_blocks(
            vec![marked_text("prefix", None), plain_text("tail-B-different")],
            "u",
        );

        let bp_a = compute_breakpoints(&a);
        let bp_b = compute_breakpoints(&b);

        assert_eq!(bp_a.len(), 1);
        assert_eq!(bp_a, bp_b);
    }

    #[test]
    fn marker_itself_does_not_alter_the_hash() {
        let five = request_with_blocks(vec![marked_text("prefix", Some(CacheTtl::FiveMinutes))], "u");
        let hour = request_with_blocks(vec![marked_text("prefix", Some(CacheTtl::OneHour))], "u");

        let bp_five = compute_breakpoints(&five);
        let bp_hour = compute_breakpoints(&hour);

        assert_eq!(bp_five[0].hash, bp_hour[0].hash);
        assert_eq!(bp_five[0].ttl, 300);
        assert_eq!(bp_hour[0].ttl, 3600);
    }

    #[test]
    fn tools_are_hashed_sorted_by_name() {
        use crate::messages::unified::{UnifiedFunction, UnifiedTool};

        let tool = |name: &str| UnifiedTool {
            function: UnifiedFunction {
                name: name.to_string(),
                description: None,
                parameters: serde_json::json!({"type": "object"}),
            },
        };

        let mut a = request_with_blocks(vec![marked_text("prefix", None)], "u");
        a.tools = Some(vec![tool("beta"), tool("alpha")]);

        let mut b = request_with_blocks(vec![marked_text("prefix", None)], "u");
        b.tools = Some(vec![tool("alpha"), tool("beta")]);

        assert_eq!(compute_breakpoints(&a)[0].hash, compute_breakpoints(&b)[0].hash);
    }

    #[test]
    fn billing_sentinel_is_skipped() {
        let mut with_sentinel = request_with_blocks(vec![marked_text("prefix", None)], "u");
        with_sentinel.system = Some(SystemContent::Blocks(vec![
            crate::messages::unified::SystemBlock {
                text: format!("{BILLING_HEADER_SENTINEL}: account-42"),
                cache_control: None,
            },
            crate::messages::unified::SystemBlock {
                text: "real instructions".to_string(),
                cache_control: None,
            },
        ]));

        let mut without = request_with_blocks(vec![marked_text("prefix", None)], "u");
        without.system = Some(SystemContent::Blocks(vec![crate::messages::unified::SystemBlock {
            text: "real instructions".to_string(),
            cache_control: None,
        }]));

        assert_eq!(
            compute_breakpoints(&with_sentinel)[0].hash,
            compute_breakpoints(&without)[0].hash
        );
    }

    #[test]
    fn no_markers_means_no_breakpoints() {
        let request = request_with_blocks(vec![plain_text("just text")], "u");
        assert!(compute_breakpoints(&request).is_empty());
    }

    #[test]
    fn session_id_extracts_embedded_uuid() {
        assert_eq!(
            session_id("abc_session_123e4567-e89b-12d3-a456-426614174000"),
            "123e4567-e89b-12d3-a456-426614174000"
        );
    }

    #[test]
    fn session_id_hashes_plain_ids() {
        let id = session_id("plain-user-id");

        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls.
        assert_eq!(id, session_id("plain-user-id"));
    }

    #[tokio::test]
    async fn cache_hit_accounting_matches_the_contract() {
        let store = MemoryStore::default();

        let breakpoints = vec![
            Breakpoint {
                hash: "h1".to_string(),
                cumulative_tokens: 100,
                ttl: 300,
            },
            Breakpoint {
                hash: "h2".to_string(),
                cumulative_tokens: 150,
                ttl: 300,
            },
        ];

        store.set_ex("cache:s1:h1", 100, 300).await.unwrap();

        let first = lookup_create(&store, "s1", &breakpoints, 200).await.unwrap();
        assert_eq!(first.cache_read_input_tokens, 100);
        assert_eq!(first.cache_creation_input_tokens, 50);
        assert_eq!(first.uncached_input_tokens, 50);

        let second = lookup_create(&store, "s1", &breakpoints, 200).await.unwrap();
        assert_eq!(second.cache_read_input_tokens, 150);
        assert_eq!(second.cache_creation_input_tokens, 0);
        assert_eq!(second.uncached_input_tokens, 50);
    }

    #[tokio::test]
    async fn cold_cache_creates_every_breakpoint() {
        let store = MemoryStore::default();

        let breakpoints = vec![
            Breakpoint {
                hash: "h1".to_string(),
                cumulative_tokens: 80,
                ttl: 300,
            },
            Breakpoint {
                hash: "h2".to_string(),
                cumulative_tokens: 120,
                ttl: 3600,
            },
        ];

        let accounting = lookup_create(&store, "s1", &breakpoints, 200).await.unwrap();

        assert_eq!(accounting.cache_read_input_tokens, 0);
        assert_eq!(accounting.cache_creation_input_tokens, 120);
        assert_eq!(accounting.uncached_input_tokens, 80);
        assert_eq!(store.get("cache:s1:h2").await.unwrap(), Some(120));
    }

    #[tokio::test]
    async fn store_failures_fail_open() {
        let accountant = PrefixCacheAccountant::with_store(Box::new(FailingStore));
        let request = request_with_blocks(vec![marked_text("prefix", None)], "u");

        let accounting = accountant.account(&request).await;

        assert_eq!(accounting.cache_read_input_tokens, 0);
        assert_eq!(accounting.cache_creation_input_tokens, 0);
        assert!(accounting.uncached_input_tokens > 0);
    }
}
