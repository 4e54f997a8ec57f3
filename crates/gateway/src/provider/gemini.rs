use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{GatewayError, GatewayResult},
    http_client::http_client,
    messages::{
        gemini::{GenerateContentRequest, GenerateContentResponse},
        unified::{UnifiedChunk, UnifiedModel, UnifiedRequest, UnifiedResponse},
    },
    pool::credential::Credential,
    provider::{Adapter, ChatStream},
};

const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) struct GeminiAdapter {
    client: Client,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .as_ref()
            .map(|url| url.as_str().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_GEMINI_API_URL.to_string());

        Self {
            client: http_client(),
            base_url,
        }
    }

    async fn send(
        &self,
        credential: &Credential,
        url: String,
        request: &GenerateContentRequest,
        streaming: bool,
    ) -> GatewayResult<reqwest::Response> {
        let body = sonic_rs::to_vec(request).map_err(|e| {
            log::error!("Failed to serialize Gemini request: {e}");
            GatewayError::Internal(None)
        })?;

        let secret = credential.access_secret();

        // OAuth credentials use a bearer token, API keys the goog header.
        let mut builder = self.client.post(&url).header("Content-Type", "application/json");
        builder = if credential.refresh_token().is_some() {
            builder.bearer_auth(secret.expose_secret())
        } else {
            builder.header("x-goog-api-key", secret.expose_secret())
        };

        if !streaming {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to send request to Gemini: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Gemini API error ({status}): {error_text}");

            return Err(GatewayError::from_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn generate(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<UnifiedResponse> {
        let model = request.model.clone();
        let url = format!("{}/models/{model}:generateContent", self.base_url);

        let wire_request = GenerateContentRequest::from(request);
        let response = self.send(credential, url, &wire_request, false).await?;

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read Gemini response body: {e}");
            GatewayError::Internal(None)
        })?;

        let wire_response: GenerateContentResponse = sonic_rs::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse Gemini generateContent response: {e}");
            GatewayError::Internal(None)
        })?;

        let mut unified = UnifiedResponse::from(wire_response);
        unified.model = model;

        Ok(unified)
    }

    async fn generate_stream(&self, credential: &Credential, request: UnifiedRequest) -> GatewayResult<ChatStream> {
        let model = request.model.clone();
        let url = format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url);

        let wire_request = GenerateContentRequest::from(request);
        let response = self.send(credential, url, &wire_request, true).await?;

        let chunk_stream = response.bytes_stream().eventsource().filter_map(move |event| {
            let model = model.clone();

            async move {
                let Ok(event) = event else {
                    log::warn!("SSE parsing error in Gemini stream");
                    return None;
                };

                let Ok(chunk) = sonic_rs::from_str::<GenerateContentResponse>(&event.data) else {
                    log::warn!("Failed to parse Gemini streaming chunk");
                    return None;
                };

                let mut unified = UnifiedChunk::from(chunk);
                unified.model = model.into();

                Some(Ok(unified))
            }
        });

        Ok(Box::pin(chunk_stream))
    }

    async fn list_models(&self, credential: &Credential) -> anyhow::Result<Vec<UnifiedModel>> {
        use anyhow::Context;

        #[derive(serde::Deserialize)]
        struct ModelsResponse {
            models: Vec<ApiModel>,
        }

        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ApiModel {
            name: String,
            display_name: Option<String>,
        }

        let secret = credential.access_secret();
        let mut builder = self.client.get(format!("{}/models", self.base_url));
        builder = if credential.refresh_token().is_some() {
            builder.bearer_auth(secret.expose_secret())
        } else {
            builder.header("x-goog-api-key", secret.expose_secret())
        };

        let response = builder.send().await.context("failed to request Gemini models")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<empty response>".to_string());
            anyhow::bail!("Gemini models request failed with status {status}: {body}");
        }

        let api_response: ModelsResponse = response
            .json()
            .await
            .context("failed to deserialize Gemini models response")?;

        Ok(api_response
            .models
            .into_iter()
            .map(|model| {
                let id = model.name.strip_prefix("models/").unwrap_or(&model.name).to_string();

                UnifiedModel {
                    display_name: model.display_name.unwrap_or_else(|| id.clone()),
                    id,
                    created: 0,
                    owned_by: "google".to_string(),
                }
            })
            .collect())
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
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(format!("Gemini token refresh failed: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), body));
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| {
            log::error!("Failed to parse Gemini token refresh response: {e}");
            GatewayError::Internal(None)
        })?;

        credential.install_access_token(
            SecretString::from(tokens.access_token),
            Some(SystemTime::now() + Duration::from_secs(tokens.expires_in)),
        );

        log::info!("Refreshed Gemini access token for credential {}", credential.uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedMessage, UnifiedRole};
    use axum::{Json, Router, extract::State, routing::post};
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct CaptureState {
        captured: Arc<Mutex<Option<(axum::http::HeaderMap, Value)>>>,
    }

    async fn handle_generate(
        State(state): State<CaptureState>,
        headers: axum::http::HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        *state.captured.lock().unwrap() = Some((headers, body));

        Json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Bonjour"}]},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5},
            "modelVersion": "gemini-2.0-flash"
        }))
    }

    #[tokio::test]
    async fn generate_uses_api_key_header_and_model_path() {
        let state = CaptureState::default();
        let app = Router::new()
            .route("/v1beta/models/{model}", post(handle_generate))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = ProviderConfig {
            base_url: Some(format!("http://{address}/v1beta").parse().unwrap()),
            asset_base_url: None,
            fallback: Vec::new(),
        };

        let adapter = GeminiAdapter::new(&config);
        let credential = Credential::new(
            Uuid::new_v4(),
            ProviderKind::Gemini,
            None,
            None,
            false,
            crate::pool::credential::SecretMaterial::ApiKey {
                key: SecretString::from("g-key".to_string()),
            },
        );

        let request = UnifiedRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![UnifiedMessage::text(UnifiedRole::User, "Hi")],
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
        };

        let response = adapter.generate(&credential, request).await.unwrap();

        assert_eq!(response.choices[0].message.content.visible_text(), "Bonjour");

        let (headers, body) = state.captured.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "g-key");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Hi");
    }
}
