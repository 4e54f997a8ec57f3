//! Upstream adapters.
//!
//! Every provider implements the same capability set; the direct API
//! adapters forward translated requests to public APIs, while the Grok
//! adapter reconstructs a dialect-compliant stream from a reverse-engineered
//! web-chat backend.

pub(crate) mod anthropic;
pub(crate) mod gemini;
pub(crate) mod grok;
pub(crate) mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use config::ProviderKind;
use futures::Stream;

use crate::{
    error::GatewayResult,
    messages::unified::{UnifiedChunk, UnifiedContent, UnifiedContentContainer, UnifiedModel, UnifiedRequest, UnifiedResponse},
    pool::credential::{Credential, UsageSnapshot},
    token_counter,
};

/// A stream of unified chunks from an upstream.
pub(crate) type ChatStream = Pin<Box<dyn Stream<Item = GatewayResult<UnifiedChunk>> + Send>>;

/// The capability set every upstream adapter provides.
#[async_trait]
pub(crate) trait Adapter: Send + Sync {
    /// The provider family this adapter speaks to.
    fn provider(&self) -> ProviderKind;

    /// One-shot completion.
    async fn generate(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<UnifiedResponse>;

    /// Streaming completion.
    async fn generate_stream(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<ChatStream>;

    /// The provider's model catalogue.
    async fn list_models(&self, credential: &Credential) -> anyhow::Result<Vec<UnifiedModel>>;

    /// Provider-specific access-token refresh. A no-op for static API keys.
    async fn refresh_credential(&self, _credential: &Credential) -> GatewayResult<()> {
        Ok(())
    }

    /// Advisory usage limits, when the provider exposes them.
    async fn usage_limits(&self, _credential: &Credential) -> GatewayResult<Option<UsageSnapshot>> {
        Ok(None)
    }

    /// Count the input tokens of a request. Defaults to the local estimate.
    async fn count_tokens(&self, _credential: &Credential, request: &UnifiedRequest) -> GatewayResult<u32> {
        Ok(token_counter::count_input_tokens(request))
    }

    /// One-time initialisation at boot. Failures downgrade health but never
    /// abort startup.
    async fn warmup(&self, _credential: &Credential) -> GatewayResult<()> {
        Ok(())
    }
}

/// Block kinds of the request the target provider cannot carry.
///
/// Dropped parts are never discarded without trace: the caller logs them and
/// appends a warning to the response stream.
pub(crate) fn dropped_block_kinds(request: &UnifiedRequest, provider: ProviderKind) -> Vec<&'static str> {
    let mut dropped = Vec::new();

    let mut note = |kind: &'static str| {
        if !dropped.contains(&kind) {
            dropped.push(kind);
        }
    };

    for message in &request.messages {
        let UnifiedContentContainer::Blocks(blocks) = &message.content else {
            continue;
        };

        for block in blocks {
            match block {
                UnifiedContent::InputAudio { .. } if provider != ProviderKind::Openai => note("input_audio"),
                UnifiedContent::File { .. } => match provider {
                    ProviderKind::Openai | ProviderKind::Grok => {}
                    _ => note("file"),
                },
                UnifiedContent::Image { source, .. } => {
                    use crate::messages::unified::UnifiedImageSource;

                    if provider == ProviderKind::Gemini && matches!(source, UnifiedImageSource::Url { .. }) {
                        note("image_url");
                    }
                }
                _ => {}
            }
        }
    }

    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedMessage, UnifiedRole};

    fn request_with_blocks(blocks: Vec<UnifiedContent>) -> UnifiedRequest {
        UnifiedRequest {
            model: "m".to_string(),
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
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn audio_is_dropped_outside_openai() {
        let request = request_with_blocks(vec![UnifiedContent::InputAudio {
            data: "aGk=".to_string(),
        }]);

        assert_eq!(dropped_block_kinds(&request, ProviderKind::Anthropic), ["input_audio"]);
        assert!(dropped_block_kinds(&request, ProviderKind::Openai).is_empty());
    }

    #[test]
    fn files_survive_on_grok() {
        let request = request_with_blocks(vec![UnifiedContent::File {
            data: "aGk=".to_string(),
            media_type: None,
        }]);

        assert!(dropped_block_kinds(&request, ProviderKind::Grok).is_empty());
        assert_eq!(dropped_block_kinds(&request, ProviderKind::Gemini), ["file"]);
    }
}
