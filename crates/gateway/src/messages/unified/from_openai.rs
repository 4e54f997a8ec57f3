//! Conversions from OpenAI wire types to unified types.
//!
//! All data is moved, not cloned; tool-call argument strings are carried
//! verbatim so an OpenAI round-trip reproduces them byte for byte.

use std::borrow::Cow;

use crate::messages::{openai, unified};

impl From<openai::ChatCompletionRequest> for unified::UnifiedRequest {
    fn from(req: openai::ChatCompletionRequest) -> Self {
        let mut system_parts = Vec::with_capacity(1);
        let mut messages = Vec::with_capacity(req.messages.len());

        for msg in req.messages {
            if msg.role == openai::ChatRole::System {
                if let Some(content) = msg.content {
                    system_parts.push(flatten_content(content));
                }
            } else {
                messages.push(unified::UnifiedMessage::from(msg));
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(unified::SystemContent::Text(system_parts.join("\n")))
        };

        Self {
            model: req.model,
            messages,
            system,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            stop_sequences: req.stop,
            stream: req.stream,
            tools: req
                .tools
                .map(|t| t.into_iter().map(unified::UnifiedTool::from).collect()),
            tool_choice: req.tool_choice.map(unified::UnifiedToolChoice::from),
            metadata: req.user.map(|user_id| unified::UnifiedMetadata {
                user_id: Some(user_id),
            }),
            extra: req.extra,
        }
    }
}

fn flatten_content(content: openai::MessageContent) -> String {
    match content {
        openai::MessageContent::Text(text) => text,
        openai::MessageContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|part| match part {
                openai::ContentPart::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

impl From<openai::ChatRole> for unified::UnifiedRole {
    fn from(role: openai::ChatRole) -> Self {
        match role {
            openai::ChatRole::System => unified::UnifiedRole::System,
            openai::ChatRole::User => unified::UnifiedRole::User,
            openai::ChatRole::Assistant => unified::UnifiedRole::Assistant,
            openai::ChatRole::Tool => unified::UnifiedRole::Tool,
        }
    }
}

impl From<openai::ContentPart> for unified::UnifiedContent {
    fn from(part: openai::ContentPart) -> Self {
        match part {
            openai::ContentPart::Text { text } => unified::UnifiedContent::Text {
                text,
                cache_control: None,
            },
            openai::ContentPart::ImageUrl { image_url } => unified::UnifiedContent::Image {
                source: image_source_from_url(image_url.url),
                cache_control: None,
            },
            openai::ContentPart::InputAudio { input_audio } => unified::UnifiedContent::InputAudio {
                data: input_audio.data,
            },
            openai::ContentPart::File { file } => unified::UnifiedContent::File {
                data: file.file_data,
                media_type: None,
            },
        }
    }
}

/// Split a `data:` URL into its MIME type and payload; anything else stays a
/// URL reference.
fn image_source_from_url(url: String) -> unified::UnifiedImageSource {
    let Some(rest) = url.strip_prefix("data:") else {
        return unified::UnifiedImageSource::Url { url };
    };

    match rest.split_once(";base64,") {
        Some((media_type, data)) => unified::UnifiedImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
        None => unified::UnifiedImageSource::Url { url },
    }
}

impl From<openai::ChatMessage> for unified::UnifiedMessage {
    fn from(msg: openai::ChatMessage) -> Self {
        let role = unified::UnifiedRole::from(msg.role);

        let content = match msg.content {
            Some(openai::MessageContent::Text(text)) => unified::UnifiedContentContainer::Text(text),
            Some(openai::MessageContent::Parts(parts)) => unified::UnifiedContentContainer::Blocks(
                parts.into_iter().map(unified::UnifiedContent::from).collect(),
            ),
            None => unified::UnifiedContentContainer::Blocks(Vec::new()),
        };

        let tool_calls = msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|call| unified::UnifiedToolCall {
                    id: call.id,
                    function: unified::UnifiedFunctionCall {
                        name: call.function.name,
                        arguments: unified::UnifiedArguments::String(call.function.arguments),
                    },
                })
                .collect()
        });

        Self {
            role,
            content,
            name: msg.name,
            tool_calls,
            tool_call_id: msg.tool_call_id,
        }
    }
}

impl From<openai::Tool> for unified::UnifiedTool {
    fn from(tool: openai::Tool) -> Self {
        Self {
            function: unified::UnifiedFunction {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters,
            },
        }
    }
}

impl From<openai::ToolChoiceMode> for unified::UnifiedToolChoiceMode {
    fn from(mode: openai::ToolChoiceMode) -> Self {
        match mode {
            openai::ToolChoiceMode::None => unified::UnifiedToolChoiceMode::None,
            openai::ToolChoiceMode::Auto => unified::UnifiedToolChoiceMode::Auto,
            openai::ToolChoiceMode::Required => unified::UnifiedToolChoiceMode::Required,
        }
    }
}

impl From<openai::ToolChoice> for unified::UnifiedToolChoice {
    fn from(choice: openai::ToolChoice) -> Self {
        match choice {
            openai::ToolChoice::Mode(mode) => unified::UnifiedToolChoice::Mode(mode.into()),
            openai::ToolChoice::Function { function, .. } => unified::UnifiedToolChoice::Specific {
                function: unified::UnifiedFunctionChoice { name: function.name },
            },
        }
    }
}

impl From<openai::FinishReason> for unified::UnifiedFinishReason {
    fn from(reason: openai::FinishReason) -> Self {
        match reason {
            openai::FinishReason::Stop => unified::UnifiedFinishReason::Stop,
            openai::FinishReason::Length => unified::UnifiedFinishReason::Length,
            openai::FinishReason::ContentFilter => unified::UnifiedFinishReason::ContentFilter,
            openai::FinishReason::ToolCalls => unified::UnifiedFinishReason::ToolCalls,
            openai::FinishReason::Other(other) => {
                log::warn!("Unknown OpenAI finish reason: {other}");
                unified::UnifiedFinishReason::Stop
            }
        }
    }
}

impl From<openai::ChatCompletionResponse> for unified::UnifiedResponse {
    fn from(resp: openai::ChatCompletionResponse) -> Self {
        Self {
            id: resp.id,
            model: resp.model,
            choices: resp
                .choices
                .into_iter()
                .map(|choice| unified::UnifiedChoice {
                    index: choice.index,
                    message: unified::UnifiedMessage::from(choice.message),
                    finish_reason: choice.finish_reason.map(unified::UnifiedFinishReason::from),
                })
                .collect(),
            usage: unified::UnifiedUsage {
                prompt_tokens: resp.usage.prompt_tokens,
                completion_tokens: resp.usage.completion_tokens,
                total_tokens: resp.usage.total_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
            created: resp.created,
            stop_reason: None,
            stop_sequence: None,
        }
    }
}

impl From<openai::StreamingToolCall> for unified::UnifiedStreamingToolCall {
    fn from(call: openai::StreamingToolCall) -> Self {
        match call {
            openai::StreamingToolCall::Start {
                index,
                id,
                tool_type: _,
                function,
            } => unified::UnifiedStreamingToolCall::Start {
                index,
                id,
                function: unified::UnifiedFunctionStart {
                    name: function.name,
                    arguments: function.arguments,
                },
            },
            openai::StreamingToolCall::Delta { index, function } => unified::UnifiedStreamingToolCall::Delta {
                index,
                function: unified::UnifiedFunctionDelta {
                    arguments: function.arguments,
                },
            },
        }
    }
}

impl From<openai::ChatCompletionChunk> for unified::UnifiedChunk {
    fn from(chunk: openai::ChatCompletionChunk) -> Self {
        Self {
            id: Cow::Owned(chunk.id),
            model: Cow::Owned(chunk.model),
            choices: chunk
                .choices
                .into_iter()
                .map(|choice| unified::UnifiedChoiceDelta {
                    index: choice.index,
                    delta: unified::UnifiedMessageDelta {
                        role: choice.delta.role.map(unified::UnifiedRole::from),
                        content: choice.delta.content,
                        reasoning: choice.delta.reasoning_content,
                        tool_calls: choice
                            .delta
                            .tool_calls
                            .map(|calls| calls.into_iter().map(unified::UnifiedStreamingToolCall::from).collect()),
                    },
                    finish_reason: choice.finish_reason.map(unified::UnifiedFinishReason::from),
                })
                .collect(),
            usage: chunk.usage.map(|u| unified::UnifiedUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            }),
            created: chunk.created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hoists_system_messages() {
        let request: openai::ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "system", "content": "Answer in French."},
                {"role": "user", "content": "Hi"}
            ]
        }))
        .unwrap();

        let unified = unified::UnifiedRequest::from(request);

        let Some(unified::SystemContent::Text(system)) = unified.system else {
            unreachable!("expected text system");
        };
        assert_eq!(system, "Be terse.\nAnswer in French.");
        assert_eq!(unified.messages.len(), 1);
    }

    #[test]
    fn data_url_images_become_inline_sources() {
        let source = image_source_from_url("data:image/png;base64,aGVsbG8=".to_string());

        let unified::UnifiedImageSource::Base64 { media_type, data } = source else {
            unreachable!("expected base64 source");
        };
        assert_eq!(media_type, "image/png");
        assert_eq!(data, "aGVsbG8=");
    }

    #[test]
    fn argument_strings_survive_verbatim() {
        let message: openai::ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "f", "arguments": "{\"a\": 1,  \"b\":2}"}
            }]
        }))
        .unwrap();

        let unified = unified::UnifiedMessage::from(message);
        let calls = unified.tool_calls.unwrap();

        assert_eq!(calls[0].function.arguments.to_json_string(), "{\"a\": 1,  \"b\":2}");
    }

    #[test]
    fn reasoning_content_maps_to_reasoning() {
        let chunk: openai::ChatCompletionChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "delta": {"reasoning_content": "thinking hard"},
                "finish_reason": null
            }]
        }))
        .unwrap();

        let unified = unified::UnifiedChunk::from(chunk);
        assert_eq!(unified.choices[0].delta.reasoning.as_deref(), Some("thinking hard"));
        assert!(unified.choices[0].delta.content.is_none());
    }
}
