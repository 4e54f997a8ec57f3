//! The relay gateway core: dialect translation, credential pooling and the
//! HTTP endpoints for every supported dialect.

use std::convert::Infallible;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt;

mod error;
mod http_client;
pub mod messages;
mod pool;
mod prefix_cache;
mod provider;
mod refresh;
mod request;
mod server;
mod storage;
mod token_counter;

pub use error::{AnthropicErrorResponse, AnthropicResult, GatewayError, GatewayResult as Result};

use messages::{Dialect, anthropic, gemini, openai, unified};
use provider::ChatStream;
use server::{GatewayServer, GatewayServerBuilder};

/// A handle to the gateway runtime, cloneable into every route.
#[derive(Clone)]
pub struct Gateway {
    server: GatewayServer,
}

/// Build the gateway runtime from configuration.
pub async fn build(config: &config::Config) -> anyhow::Result<Gateway> {
    let server = GatewayServerBuilder::new(config)
        .build()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize gateway: {e}"))?;

    Ok(Gateway { server })
}

/// Router for the OpenAI-style endpoint family.
pub fn openai_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(openai_models))
        .with_state(gateway)
}

/// Router for the Anthropic-style endpoint family.
///
/// The model catalogue is served once, OpenAI-shaped, on `/v1/models`.
pub fn anthropic_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .with_state(gateway)
}

/// Router for the Gemini-style endpoint family.
pub fn gemini_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .route("/v1beta/models", get(gemini_models))
        .with_state(gateway)
}

async fn chat_completions(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Sonic(wire_request): Sonic<openai::ChatCompletionRequest>,
) -> Result<Response> {
    log::debug!(
        "OpenAI chat completions for model '{}' with {} message(s), streaming: {}",
        wire_request.model,
        wire_request.messages.len(),
        wire_request.stream.unwrap_or(false),
    );

    let request = unified::UnifiedRequest::from(wire_request);
    let context = request::extract_context(&headers, request.metadata.as_ref().and_then(|m| m.user_id.clone()));

    if request.stream.unwrap_or(false) {
        let stream = gateway
            .server
            .completions_stream(request, &context, Dialect::OpenAi)
            .await?;

        let event_stream = stream.map(|result| {
            let event = match result {
                Ok(chunk) => {
                    let wire_chunk = openai::ChatCompletionChunk::from(chunk);
                    let json = sonic_rs::to_string(&wire_chunk).unwrap_or_else(|e| {
                        log::error!("Failed to serialize chunk: {e}");
                        r#"{"error":"serialization failed"}"#.to_string()
                    });

                    Event::default().data(json)
                }
                Err(e) => {
                    log::error!("Stream error: {e}");
                    Event::default().data(format!(
                        r#"{{"error":{{"message":{},"type":"{}"}}}}"#,
                        serde_json::Value::String(e.client_message()),
                        e.error_type(),
                    ))
                }
            };

            Ok::<_, Infallible>(event)
        });

        let with_done = event_stream.chain(futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

        return Ok(Sse::new(with_done).into_response());
    }

    let response = gateway.server.completions(request, &context, Dialect::OpenAi).await?;

    Ok(Json(openai::ChatCompletionResponse::from(response)).into_response())
}

async fn openai_models(State(gateway): State<Gateway>) -> Result<Json<openai::ModelsResponse>> {
    let models = gateway.server.models().await;

    Ok(Json(openai::ModelsResponse {
        object: openai::ObjectType::List,
        data: models.into_iter().map(openai::Model::from).collect(),
    }))
}

async fn anthropic_messages(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Sonic(wire_request): Sonic<anthropic::MessagesRequest>,
) -> AnthropicResult<Response> {
    log::debug!(
        "Anthropic messages for model '{}' with {} message(s), streaming: {}",
        wire_request.model,
        wire_request.messages.len(),
        wire_request.stream.unwrap_or(false),
    );

    let request = unified::UnifiedRequest::from(wire_request);
    let context = request::extract_context(&headers, request.metadata.as_ref().and_then(|m| m.user_id.clone()));

    if request.stream.unwrap_or(false) {
        let stream = gateway
            .server
            .completions_stream(request, &context, Dialect::Anthropic)
            .await
            .map_err(AnthropicErrorResponse::from)?;

        return Ok(Sse::new(anthropic_event_stream(stream)).into_response());
    }

    let response = gateway
        .server
        .completions(request, &context, Dialect::Anthropic)
        .await
        .map_err(AnthropicErrorResponse::from)?;

    Ok(Json(anthropic::MessagesResponse::from(response)).into_response())
}

/// Encode a unified chunk stream as the typed Anthropic SSE event sequence.
///
/// The encoder is stateful; a stream the upstream dropped without a terminal
/// chunk is still closed with `message_delta`/`message_stop`.
fn anthropic_event_stream(
    stream: ChatStream,
) -> impl futures::Stream<Item = std::result::Result<Event, Infallible>> + Send {
    use std::collections::VecDeque;

    struct EncodeState {
        stream: Option<ChatStream>,
        encoder: unified::to_anthropic::EventEncoder,
        queue: VecDeque<anthropic::StreamEvent>,
    }

    let state = EncodeState {
        stream: Some(stream),
        encoder: unified::to_anthropic::EventEncoder::new(),
        queue: VecDeque::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                let json = sonic_rs::to_string(&event).unwrap_or_else(|e| {
                    log::error!("Failed to serialize Anthropic streaming event: {e}");
                    r#"{"type":"ping"}"#.to_string()
                });

                let sse = Event::default().event(anthropic_event_name(&event)).data(json);
                return Some((Ok::<_, Infallible>(sse), state));
            }

            let Some(stream) = state.stream.as_mut() else {
                return None;
            };

            match stream.next().await {
                Some(Ok(chunk)) => state.queue.extend(state.encoder.encode(chunk)),
                Some(Err(e)) => {
                    log::error!("Stream error: {e}");
                    state.queue.push_back(anthropic::StreamEvent::Error {
                        error: anthropic::ErrorDetails {
                            r#type: e.error_type().to_string(),
                            message: e.client_message(),
                        },
                    });
                    state.queue.extend(state.encoder.finish());
                    state.stream = None;
                }
                None => {
                    state.queue.extend(state.encoder.finish());
                    state.stream = None;
                }
            }
        }
    })
}

fn anthropic_event_name(event: &anthropic::StreamEvent) -> &'static str {
    match event {
        anthropic::StreamEvent::MessageStart { .. } => "message_start",
        anthropic::StreamEvent::ContentBlockStart { .. } => "content_block_start",
        anthropic::StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        anthropic::StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        anthropic::StreamEvent::MessageDelta { .. } => "message_delta",
        anthropic::StreamEvent::MessageStop => "message_stop",
        anthropic::StreamEvent::Ping => "ping",
        anthropic::StreamEvent::Error { .. } => "error",
    }
}

async fn anthropic_count_tokens(
    State(gateway): State<Gateway>,
    Sonic(wire_request): Sonic<anthropic::CountTokensRequest>,
) -> AnthropicResult<Json<anthropic::CountTokensResponse>> {
    let request = unified::UnifiedRequest::from(wire_request);

    let input_tokens = gateway
        .server
        .count_tokens(request, Dialect::Anthropic)
        .await
        .map_err(AnthropicErrorResponse::from)?;

    Ok(Json(anthropic::CountTokensResponse { input_tokens }))
}

async fn gemini_generate(
    State(gateway): State<Gateway>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Sonic(wire_request): Sonic<gemini::GenerateContentRequest>,
) -> Result<Response> {
    // The dialect encodes the action in the final path segment:
    // `{model}:generateContent` or `{model}:streamGenerateContent`.
    let (model, action) = model_action.split_once(':').ok_or_else(|| {
        GatewayError::InvalidRequest(format!("Expected 'model:action' in path, got '{model_action}'"))
    })?;

    let streaming = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(GatewayError::InvalidRequest(format!("Unknown action '{other}'")));
        }
    };

    log::debug!("Gemini {action} for model '{model}'");

    let mut request = unified::UnifiedRequest::from(wire_request);
    request.model = model.to_string();
    request.stream = Some(streaming);

    let context = request::extract_context(&headers, None);

    if streaming {
        let stream = gateway
            .server
            .completions_stream(request, &context, Dialect::Gemini)
            .await?;

        // Newline-delimited JSON chunks; tool-call fragments are buffered by
        // the encoder and emitted whole.
        let body_stream = futures::stream::unfold(
            (stream, unified::to_gemini::ChunkEncoder::new()),
            |(mut stream, mut encoder)| async move {
                loop {
                    match stream.next().await {
                        Some(Ok(chunk)) => {
                            if let Some(wire_chunk) = encoder.encode(chunk) {
                                let mut line = sonic_rs::to_string(&wire_chunk).unwrap_or_else(|e| {
                                    log::error!("Failed to serialize Gemini chunk: {e}");
                                    "{}".to_string()
                                });
                                line.push('\n');

                                return Some((Ok::<_, Infallible>(line), (stream, encoder)));
                            }
                        }
                        Some(Err(e)) => {
                            log::error!("Stream error: {e}");
                            let line = format!(
                                "{}\n",
                                serde_json::json!({
                                    "error": {"message": e.client_message(), "code": e.status_code().as_u16()}
                                })
                            );
                            return Some((Ok(line), (stream, encoder)));
                        }
                        None => return None,
                    }
                }
            },
        );

        let response = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(body_stream))
            .map_err(|e| {
                log::error!("Failed to build streaming response: {e}");
                GatewayError::Internal(None)
            })?;

        return Ok(response);
    }

    let response = gateway.server.completions(request, &context, Dialect::Gemini).await?;

    Ok(Json(gemini::GenerateContentResponse::from(response)).into_response())
}

async fn gemini_models(State(gateway): State<Gateway>) -> Result<Json<gemini::ModelsResponse>> {
    let models = gateway.server.models().await;

    Ok(Json(gemini::ModelsResponse {
        models: models
            .into_iter()
            .map(|model| gemini::ModelInfo {
                name: format!("models/{}", model.id),
                display_name: Some(model.display_name),
            })
            .collect(),
    }))
}
