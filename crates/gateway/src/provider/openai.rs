use std::time::Duration;

use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::ExposeSecret;

use crate::{
    error::{GatewayError, GatewayResult},
    http_client::http_client,
    messages::{
        openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse},
        unified::{UnifiedChunk, UnifiedModel, UnifiedRequest, UnifiedResponse},
    },
    pool::credential::Credential,
    provider::{Adapter, ChatStream},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) struct OpenAiAdapter {
    client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .as_ref()
            .map(|url| url.as_str().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string());

        Self {
            client: http_client(),
            base_url,
        }
    }

    async fn send(
        &self,
        credential: &Credential,
        request: &ChatCompletionRequest,
        streaming: bool,
    ) -> GatewayResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = sonic_rs::to_vec(request)
            .map_err(|e| GatewayError::InvalidRequest(format!("Failed to serialize request: {e}")))?;

        let mut builder = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", credential.access_secret().expose_secret()))
            .header("Content-Type", "application/json")
            .body(body);

        if !streaming {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to send request to OpenAI: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("OpenAI API error ({status}): {error_text}");

            return Err(GatewayError::from_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Openai
    }

    async fn generate(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<UnifiedResponse> {
        let mut wire_request = ChatCompletionRequest::from(request);
        wire_request.stream = Some(false);

        let response = self.send(credential, &wire_request, false).await?;

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read OpenAI response body: {e}");
            GatewayError::Internal(None)
        })?;

        let wire_response: ChatCompletionResponse = sonic_rs::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse OpenAI chat completion response: {e}");
            GatewayError::Internal(None)
        })?;

        Ok(UnifiedResponse::from(wire_response))
    }

    async fn generate_stream(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<ChatStream> {
        let mut wire_request = ChatCompletionRequest::from(request);
        wire_request.stream = Some(true);

        let response = self.send(credential, &wire_request, true).await?;

        let chunk_stream = response.bytes_stream().eventsource().filter_map(|event| async move {
            let Ok(event) = event else {
                log::warn!("SSE parsing error in OpenAI stream");
                return None;
            };

            if event.data == "[DONE]" {
                return None;
            }

            let Ok(chunk) = sonic_rs::from_str::<ChatCompletionChunk>(&event.data) else {
                log::warn!("Failed to parse OpenAI streaming chunk");
                return None;
            };

            Some(Ok(UnifiedChunk::from(chunk)))
        });

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
            created: Option<u64>,
            owned_by: Option<String>,
        }

        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(credential.access_secret().expose_secret())
            .send()
            .await
            .context("failed to request OpenAI models")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            anyhow::bail!("OpenAI models request failed with status {status}: {body}");
        }

        let api_response: ModelsResponse = response
            .json()
            .await
            .context("failed to deserialize OpenAI models response")?;

        Ok(api_response
            .data
            .into_iter()
            .map(|model| UnifiedModel {
                display_name: model.id.clone(),
                id: model.id,
                created: model.created.unwrap_or(0),
                owned_by: model.owned_by.unwrap_or_else(|| "openai".to_string()),
            })
            .collect())
    }
}
