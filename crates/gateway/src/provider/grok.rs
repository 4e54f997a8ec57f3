//! Adapter for the Grok web-chat backend.
//!
//! The backend is not a public API: requests need a browser-fingerprinted
//! header set, accept a single prompt string per turn and answer with a
//! noisy newline-delimited event stream that is reconstructed into a clean
//! dialect-compliant stream by [`stream::Reconstructor`].

mod prompt;
mod stream;

use std::collections::VecDeque;
use std::time::SystemTime;

use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use futures::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{GatewayError, GatewayResult},
    http_client::http_client,
    messages::unified::{
        UnifiedChoice, UnifiedChunk, UnifiedContent, UnifiedContentContainer, UnifiedFinishReason, UnifiedMessage,
        UnifiedModel, UnifiedRequest, UnifiedResponse, UnifiedRole, UnifiedStreamingToolCall, UnifiedUsage,
    },
    pool::credential::{Credential, UsageSnapshot},
    provider::{Adapter, ChatStream},
    token_counter,
};

const DEFAULT_GROK_URL: &str = "https://grok.com";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";
const SEC_CH_UA: &str = r#""Not A(Brand";v="8", "Chromium";v="132", "Google Chrome";v="132""#;

/// Queries allowed per rate window on the web backend.
const TOTAL_QUERIES: u32 = 80;

pub(crate) struct GrokAdapter {
    client: Client,
    base_url: String,
    asset_base: Option<Url>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    temporary: bool,
    model_name: String,
    message: String,
    file_attachments: Vec<String>,
    tool_overrides: serde_json::Map<String, serde_json::Value>,
    disable_search: bool,
    enable_image_generation: bool,
    return_image_bytes: bool,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    result: Option<StreamResult>,
}

#[derive(Debug, Deserialize)]
struct StreamResult {
    #[serde(default)]
    response: Option<stream::GrokEvent>,
}

impl GrokAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .as_ref()
            .map(|url| url.as_str().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_GROK_URL.to_string());

        Self {
            client: http_client(),
            base_url,
            asset_base: config.asset_base_url.clone(),
        }
    }

    /// Browser-fingerprinted header set: the cookie pair, user-agent derived
    /// client hints and a request id deterministic over the message.
    fn request_builder(&self, path: &str, credential: &Credential, message: &str) -> GatewayResult<reqwest::RequestBuilder> {
        let (sso, sso_rw) = credential.cookie_pair().ok_or_else(|| {
            GatewayError::AuthenticationFailed("Grok credential is missing its session cookies".to_string())
        })?;

        let cookie = format!("sso={}; sso-rw={}", sso.expose_secret(), sso_rw.expose_secret());

        Ok(self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Cookie", cookie)
            .header("User-Agent", USER_AGENT)
            .header("sec-ch-ua", SEC_CH_UA)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Windows\"")
            .header("Origin", self.base_url.clone())
            .header("Referer", format!("{}/", self.base_url))
            .header("x-xai-request-id", deterministic_request_id(message).to_string())
            .header("Content-Type", "application/json"))
    }

    /// Upload one binary part, returning its attachment id.
    async fn upload_file(&self, credential: &Credential, attachment: &prompt::Attachment) -> GatewayResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct UploadResponse {
            file_metadata_id: String,
        }

        let body = serde_json::json!({
            "fileName": attachment.file_name,
            "fileMimeType": attachment.mime_type,
            "content": attachment.data,
        });

        let response = self
            .request_builder("/rest/app-chat/upload-file", credential, &attachment.file_name)?
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Grok file upload failed: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Grok upload error ({status}): {error_text}");
            return Err(GatewayError::from_status(status.as_u16(), error_text));
        }

        let uploaded: UploadResponse = response.json().await.map_err(|e| {
            log::error!("Failed to parse Grok upload response: {e}");
            GatewayError::Internal(None)
        })?;

        Ok(uploaded.file_metadata_id)
    }

    async fn open_stream(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<ChatStream> {
        let model = request.model.clone();
        let collapsed = prompt::collapse(&request);

        let mut file_attachments = Vec::with_capacity(collapsed.attachments.len());
        for attachment in &collapsed.attachments {
            file_attachments.push(self.upload_file(credential, attachment).await?);
        }

        let chat_request = ChatRequest {
            temporary: true,
            model_name: model.clone(),
            message: collapsed.message.clone(),
            file_attachments,
            tool_overrides: serde_json::Map::new(),
            disable_search: false,
            enable_image_generation: true,
            return_image_bytes: false,
        };

        let response = self
            .request_builder("/rest/app-chat/conversations/new", credential, &collapsed.message)?
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to send request to Grok: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Grok API error ({status}): {error_text}");

            // The web backend reports an expired session as a redirect-ish 403.
            return Err(GatewayError::from_status(status.as_u16(), error_text));
        }

        let reconstructor = stream::Reconstructor::new(model, self.asset_base.clone());

        let text_stream = response
            .bytes_stream()
            .map(|result| result.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()));

        // One stream task owns all per-response state; it is freed when the
        // stream is dropped, terminal or not.
        let chunk_stream = futures::stream::unfold(
            StreamTask {
                bytes: Box::pin(text_stream),
                buffer: String::new(),
                reconstructor,
                pending: VecDeque::new(),
                upstream_done: false,
            },
            |mut task| async move {
                loop {
                    if let Some(chunk) = task.pending.pop_front() {
                        return Some((Ok(chunk), task));
                    }

                    if task.upstream_done {
                        return None;
                    }

                    match task.bytes.next().await {
                        Some(Ok(text)) => {
                            task.buffer.push_str(&text);

                            while let Some(newline) = task.buffer.find('\n') {
                                let line: String = task.buffer.drain(..=newline).collect();
                                task.ingest_line(line.trim());
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("Grok stream transport error: {e}");
                            task.upstream_done = true;
                            return Some((
                                Err(GatewayError::ConnectionError(format!("Grok stream failed: {e}"))),
                                task,
                            ));
                        }
                        None => {
                            let trailing: String = std::mem::take(&mut task.buffer);
                            task.ingest_line(trailing.trim());

                            task.upstream_done = true;
                            if let Some(chunk) = task.reconstructor.finish() {
                                task.pending.push_back(chunk);
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }
}

struct StreamTask {
    bytes: futures::stream::BoxStream<'static, reqwest::Result<String>>,
    buffer: String,
    reconstructor: stream::Reconstructor,
    pending: VecDeque<UnifiedChunk>,
    upstream_done: bool,
}

impl StreamTask {
    fn ingest_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }

        let Ok(parsed) = sonic_rs::from_str::<StreamLine>(line) else {
            log::warn!("Skipping unparsable Grok stream line");
            return;
        };

        let Some(event) = parsed.result.and_then(|r| r.response) else {
            return;
        };

        self.pending.extend(self.reconstructor.process(event));
    }
}

/// Request id derived from the message content, stable across retries.
fn deterministic_request_id(message: &str) -> Uuid {
    let digest = Sha256::digest(message.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);

    uuid::Builder::from_bytes(bytes).into_uuid()
}

#[async_trait]
impl Adapter for GrokAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Grok
    }

    async fn generate(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<UnifiedResponse> {
        let prompt_tokens = token_counter::count_input_tokens(&request);
        let model = request.model.clone();

        let mut stream = self.open_stream(credential, request).await?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content {
                    content.push_str(&text);
                }
                if let Some(text) = choice.delta.reasoning {
                    reasoning.push_str(&text);
                }
                for call in choice.delta.tool_calls.unwrap_or_default() {
                    if let UnifiedStreamingToolCall::Start { id, function, .. } = call {
                        tool_calls.push(UnifiedContent::ToolUse {
                            id,
                            name: function.name,
                            input: serde_json::from_str(&function.arguments)
                                .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new())),
                            cache_control: None,
                        });
                    }
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        let mut blocks = Vec::new();

        if !reasoning.is_empty() {
            blocks.push(UnifiedContent::Thinking {
                thinking: reasoning,
                signature: None,
            });
        }

        let completion_tokens = token_counter::count_text(&content);

        if !content.is_empty() {
            blocks.push(UnifiedContent::Text {
                text: content,
                cache_control: None,
            });
        }

        blocks.extend(tool_calls);

        Ok(UnifiedResponse {
            id: format!("grok-{}", Uuid::new_v4()),
            model,
            choices: vec![UnifiedChoice {
                index: 0,
                message: UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    content: UnifiedContentContainer::Blocks(blocks),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: finish_reason.or(Some(UnifiedFinishReason::Stop)),
            }],
            usage: UnifiedUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
            created: 0,
            stop_reason: None,
            stop_sequence: None,
        })
    }

    async fn generate_stream(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<ChatStream> {
        self.open_stream(credential, request).await
    }

    async fn list_models(&self, _credential: &Credential) -> anyhow::Result<Vec<UnifiedModel>> {
        // The web backend has no model listing; expose the known set.
        Ok(["grok-3", "grok-4"]
            .into_iter()
            .map(|id| UnifiedModel {
                id: id.to_string(),
                display_name: id.to_string(),
                created: 0,
                owned_by: "xai".to_string(),
            })
            .collect())
    }

    async fn usage_limits(&self, credential: &Credential) -> GatewayResult<Option<UsageSnapshot>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RateLimits {
            #[serde(default)]
            remaining_queries: Option<u32>,
            #[serde(default)]
            total_queries: Option<u32>,
        }

        let response = self
            .request_builder("/rest/rate-limits", credential, "rate-limits")?
            .json(&serde_json::json!({ "requestKind": "DEFAULT", "modelName": "grok-4" }))
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Grok rate-limit query failed: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::from_status(status.as_u16(), error_text));
        }

        let limits: RateLimits = response.json().await.map_err(|e| {
            log::error!("Failed to parse Grok rate-limit response: {e}");
            GatewayError::Internal(None)
        })?;

        Ok(Some(UsageSnapshot {
            remaining_queries: limits.remaining_queries.unwrap_or(0),
            total_queries: limits.total_queries.unwrap_or(TOTAL_QUERIES),
            refreshed_at: SystemTime::now(),
        }))
    }

    /// There is no token to refresh; a refresh renews the advisory usage
    /// snapshot whose freshness doubles as this credential's expiry window.
    async fn refresh_credential(&self, credential: &Credential) -> GatewayResult<()> {
        if let Some(snapshot) = self.usage_limits(credential).await? {
            credential.set_usage_snapshot(snapshot);
        }

        Ok(())
    }

    async fn warmup(&self, credential: &Credential) -> GatewayResult<()> {
        self.refresh_credential(credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_deterministic_over_the_message() {
        let a = deterministic_request_id("hello");
        let b = deterministic_request_id("hello");
        let c = deterministic_request_id("other");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn chat_request_serializes_camel_case() {
        let request = ChatRequest {
            temporary: true,
            model_name: "grok-4".to_string(),
            message: "hi".to_string(),
            file_attachments: vec!["f1".to_string()],
            tool_overrides: serde_json::Map::new(),
            disable_search: false,
            enable_image_generation: true,
            return_image_bytes: false,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["modelName"], "grok-4");
        assert_eq!(value["fileAttachments"][0], "f1");
        assert_eq!(value["enableImageGeneration"], true);
    }
}
