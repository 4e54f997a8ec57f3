use std::borrow::Cow;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, header::CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{GatewayError, GatewayResult},
    http_client::http_client,
    messages::{
        anthropic::{
            ContentBlock, ContentDelta, CountTokensResponse, MessagesRequest, MessagesResponse, StreamEvent,
        },
        unified::{
            UnifiedChoiceDelta, UnifiedChunk, UnifiedFinishReason, UnifiedFunctionDelta, UnifiedFunctionStart,
            UnifiedMessageDelta, UnifiedModel, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedStreamingToolCall,
            UnifiedUsage,
        },
    },
    pool::credential::Credential,
    provider::{Adapter, ChatStream},
};

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) struct AnthropicAdapter {
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .as_ref()
            .map(|url| url.as_str().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string());

        Self {
            client: http_client(),
            base_url,
        }
    }

    /// OAuth credentials authenticate with a bearer token, API keys with the
    /// `x-api-key` header.
    fn authorize(&self, builder: RequestBuilder, credential: &Credential) -> RequestBuilder {
        let secret = credential.access_secret();

        if credential.refresh_token().is_some() {
            builder.bearer_auth(secret.expose_secret())
        } else {
            builder.header("x-api-key", secret.expose_secret())
        }
    }

    async fn send(
        &self,
        credential: &Credential,
        path: &str,
        request: &MessagesRequest,
        streaming: bool,
    ) -> GatewayResult<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);

        let body = sonic_rs::to_vec(request).map_err(|e| {
            log::error!("Failed to serialize Anthropic request: {e}");
            GatewayError::Internal(None)
        })?;

        let mut builder = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        builder = self.authorize(builder, credential);

        if !streaming {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to send request to Anthropic: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Anthropic API error ({status}): {error_text}");

            return Err(GatewayError::from_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn generate(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<UnifiedResponse> {
        let mut wire_request = MessagesRequest::from(request);
        wire_request.stream = Some(false);

        let response = self.send(credential, "/messages", &wire_request, false).await?;

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read Anthropic response body: {e}");
            GatewayError::Internal(None)
        })?;

        let wire_response: MessagesResponse = sonic_rs::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse Anthropic messages response: {e}");
            GatewayError::Internal(None)
        })?;

        Ok(UnifiedResponse::from(wire_response))
    }

    async fn generate_stream(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<ChatStream> {
        let mut wire_request = MessagesRequest::from(request);
        wire_request.stream = Some(true);

        let response = self.send(credential, "/messages", &wire_request, true).await?;

        let event_stream = response.bytes_stream().eventsource();

        let chunk_stream = futures::stream::unfold(
            (Box::pin(event_stream), StreamState::new()),
            |(mut stream, mut state)| async move {
                loop {
                    let event = stream.next().await?;

                    let Ok(event) = event else {
                        log::warn!("SSE parsing error in Anthropic stream");
                        continue;
                    };

                    let Ok(stream_event) = sonic_rs::from_str::<StreamEvent>(&event.data) else {
                        log::warn!("Failed to parse Anthropic streaming event");
                        continue;
                    };

                    if let StreamEvent::Error { error } = &stream_event {
                        log::error!("Anthropic stream error event: {} - {}", error.r#type, error.message);
                        let error = GatewayError::from_status(502, error.message.clone());
                        return Some((Err(error), (stream, state)));
                    }

                    if let Some(chunk) = state.process(stream_event) {
                        return Some((Ok(chunk), (stream, state)));
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }

    async fn list_models(&self, credential: &Credential) -> anyhow::Result<Vec<UnifiedModel>> {
        use anyhow::Context;

        #[derive(serde::Deserialize)]
        struct ModelsResponse {
            data: Vec<ApiModel>,
        }

        #[derive(serde::Deserialize)]
        struct ApiModel {
            id: String,
            display_name: Option<String>,
        }

        let mut builder = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION);
        builder = self.authorize(builder, credential);

        let response = builder.send().await.context("failed to request Anthropic models")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            anyhow::bail!("Anthropic models request failed with status {status}: {body}");
        }

        let api_response: ModelsResponse = response
            .json()
            .await
            .context("failed to deserialize Anthropic models response")?;

        Ok(api_response
            .data
            .into_iter()
            .map(|model| UnifiedModel {
                display_name: model.display_name.unwrap_or_else(|| model.id.clone()),
                id: model.id,
                created: 0,
                owned_by: "anthropic".to_string(),
            })
            .collect())
    }

    async fn count_tokens(&self, credential: &Credential, request: &UnifiedRequest) -> GatewayResult<u32> {
        let mut wire_request = MessagesRequest::from(request.clone());
        wire_request.stream = Some(false);

        let response = self
            .send(credential, "/messages/count_tokens", &wire_request, false)
            .await?;

        let counted: CountTokensResponse = response.json().await.map_err(|e| {
            log::error!("Failed to parse Anthropic count tokens response: {e}");
            GatewayError::Internal(None)
        })?;

        Ok(counted.input_tokens)
    }

    async fn refresh_credential(&self, credential: &Credential) -> GatewayResult<()> {
        let Some(refresh_token) = credential.refresh_token() else {
            return Ok(());
        };

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let response = self
            .client
            .post(OAUTH_TOKEN_URL)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token.expose_secret(),
                "client_id": OAUTH_CLIENT_ID,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Anthropic token refresh failed: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body));
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| {
            log::error!("Failed to parse Anthropic token refresh response: {e}");
            GatewayError::Internal(None)
        })?;

        credential.install_access_token(
            SecretString::from(tokens.access_token),
            Some(SystemTime::now() + Duration::from_secs(tokens.expires_in)),
        );

        log::info!("Refreshed Anthropic access token for credential {}", credential.uuid);
        Ok(())
    }
}

/// Inbound stream reconstruction: typed Anthropic events to unified chunks.
///
/// Tracks the message id and model from `message_start`, keeps one streaming
/// tool-call index per tool_use block and splits thinking deltas onto the
/// reasoning channel.
struct StreamState {
    message_id: Option<String>,
    model: Option<String>,
    usage: Option<UnifiedUsage>,
    /// Anthropic block index to unified streaming tool-call index.
    tool_indexes: HashMap<u32, usize>,
    next_tool_index: usize,
}

impl StreamState {
    fn new() -> Self {
        Self {
            message_id: None,
            model: None,
            usage: None,
            tool_indexes: HashMap::new(),
            next_tool_index: 0,
        }
    }

    fn chunk(&self, delta: UnifiedMessageDelta, finish_reason: Option<UnifiedFinishReason>) -> UnifiedChunk {
        UnifiedChunk {
            id: Cow::Owned(self.message_id.clone().unwrap_or_default()),
            model: Cow::Owned(self.model.clone().unwrap_or_default()),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: if finish_reason.is_some() { self.usage.clone() } else { None },
            created: 0,
        }
    }

    fn process(&mut self, event: StreamEvent) -> Option<UnifiedChunk> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.message_id = Some(message.id);
                self.model = Some(message.model);
                self.usage = Some(message.usage.into());

                Some(self.chunk(
                    UnifiedMessageDelta {
                        role: Some(UnifiedRole::Assistant),
                        ..Default::default()
                    },
                    None,
                ))
            }

            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indexes.insert(index, tool_index);

                    Some(self.chunk(
                        UnifiedMessageDelta {
                            tool_calls: Some(vec![UnifiedStreamingToolCall::Start {
                                index: tool_index,
                                id,
                                function: UnifiedFunctionStart {
                                    name,
                                    arguments: String::new(),
                                },
                            }]),
                            ..Default::default()
                        },
                        None,
                    ))
                }
                ContentBlock::Text { text, .. } if !text.is_empty() => Some(self.chunk(
                    UnifiedMessageDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )),
                _ => None,
            },

            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => Some(self.chunk(
                    UnifiedMessageDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )),
                ContentDelta::ThinkingDelta { thinking } => Some(self.chunk(
                    UnifiedMessageDelta {
                        reasoning: Some(thinking),
                        ..Default::default()
                    },
                    None,
                )),
                ContentDelta::InputJsonDelta { partial_json } => {
                    let tool_index = *self.tool_indexes.get(&index)?;

                    Some(self.chunk(
                        UnifiedMessageDelta {
                            tool_calls: Some(vec![UnifiedStreamingToolCall::Delta {
                                index: tool_index,
                                function: UnifiedFunctionDelta {
                                    arguments: partial_json,
                                },
                            }]),
                            ..Default::default()
                        },
                        None,
                    ))
                }
                ContentDelta::SignatureDelta { .. } => None,
            },

            StreamEvent::MessageDelta { delta, usage } => {
                let mut unified_usage = UnifiedUsage::from(usage);

                // Input tokens only arrive on message_start.
                if let Some(start_usage) = &self.usage
                    && unified_usage.prompt_tokens == 0
                {
                    unified_usage.prompt_tokens = start_usage.prompt_tokens;
                    unified_usage.total_tokens = unified_usage.prompt_tokens + unified_usage.completion_tokens;
                }
                self.usage = Some(unified_usage);

                let finish_reason = delta
                    .stop_reason
                    .map(UnifiedFinishReason::from)
                    .unwrap_or(UnifiedFinishReason::Stop);

                Some(self.chunk(UnifiedMessageDelta::default(), Some(finish_reason)))
            }

            // Ping, ContentBlockStop, MessageStop and errors produce nothing.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> StreamEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn message_start_emits_role_chunk() {
        let mut state = StreamState::new();

        let chunk = state
            .process(event(json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "claude-sonnet-4",
                    "usage": {"input_tokens": 12, "output_tokens": 0}
                }
            })))
            .unwrap();

        assert_eq!(chunk.id, "msg_1");
        assert_eq!(chunk.choices[0].delta.role, Some(UnifiedRole::Assistant));
    }

    #[test]
    fn thinking_deltas_go_to_reasoning() {
        let mut state = StreamState::new();

        let chunk = state
            .process(event(json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "thinking_delta", "thinking": "hmm"}
            })))
            .unwrap();

        assert_eq!(chunk.choices[0].delta.reasoning.as_deref(), Some("hmm"));
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn tool_blocks_get_sequential_stream_indexes() {
        let mut state = StreamState::new();

        // Two tool_use blocks at Anthropic indexes 1 and 3.
        for (block_index, id) in [(1, "toolu_a"), (3, "toolu_b")] {
            state.process(event(json!({
                "type": "content_block_start",
                "index": block_index,
                "content_block": {"type": "tool_use", "id": id, "name": "f", "input": {}}
            })));
        }

        let chunk = state
            .process(event(json!({
                "type": "content_block_delta",
                "index": 3,
                "delta": {"type": "input_json_delta", "partial_json": "{\"x\":1}"}
            })))
            .unwrap();

        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        let UnifiedStreamingToolCall::Delta { index, .. } = &calls[0] else {
            unreachable!("expected delta");
        };
        assert_eq!(*index, 1);
    }

    #[test]
    fn message_delta_merges_prompt_tokens_from_start() {
        let mut state = StreamState::new();

        state.process(event(json!({
            "type": "message_start",
            "message": {
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": "claude-sonnet-4",
                "usage": {"input_tokens": 40, "output_tokens": 0}
            }
        })));

        let chunk = state
            .process(event(json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"input_tokens": 0, "output_tokens": 9}
            })))
            .unwrap();

        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 40);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, 49);
        assert_eq!(chunk.choices[0].finish_reason, Some(UnifiedFinishReason::Stop));
    }
}
