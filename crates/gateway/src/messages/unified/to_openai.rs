//! Conversions from unified types to OpenAI wire types.

use crate::messages::{openai, unified};

impl From<unified::UnifiedRequest> for openai::ChatCompletionRequest {
    fn from(req: unified::UnifiedRequest) -> Self {
        let mut messages = Vec::with_capacity(req.messages.len() + usize::from(req.system.is_some()));

        if let Some(system) = req.system {
            messages.push(openai::ChatMessage {
                role: openai::ChatRole::System,
                content: Some(openai::MessageContent::Text(system.joined().into_owned())),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in req.messages {
            messages.push(openai::ChatMessage::from(msg));
        }

        Self {
            model: req.model,
            messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stop: req.stop_sequences,
            stream: req.stream,
            tools: req.tools.map(|t| t.into_iter().map(openai::Tool::from).collect()),
            tool_choice: req.tool_choice.map(openai::ToolChoice::from),
            user: req.metadata.and_then(|m| m.user_id),
            extra: req.extra,
        }
    }
}

impl From<unified::UnifiedRole> for openai::ChatRole {
    fn from(role: unified::UnifiedRole) -> Self {
        match role {
            unified::UnifiedRole::System => openai::ChatRole::System,
            unified::UnifiedRole::User => openai::ChatRole::User,
            unified::UnifiedRole::Assistant => openai::ChatRole::Assistant,
            unified::UnifiedRole::Tool => openai::ChatRole::Tool,
        }
    }
}

impl From<unified::UnifiedMessage> for openai::ChatMessage {
    fn from(msg: unified::UnifiedMessage) -> Self {
        let role = openai::ChatRole::from(msg.role);

        // Tool calls come from the OpenAI-shaped field when present (with the
        // original argument strings), otherwise from ToolUse blocks.
        let tool_calls = msg.compute_tool_calls().map(|calls| {
            calls
                .into_iter()
                .map(|call| openai::ToolCall {
                    id: call.id,
                    tool_type: openai::ToolType::Function,
                    function: openai::FunctionCall {
                        name: call.function.name,
                        arguments: call.function.arguments.to_json_string(),
                    },
                })
                .collect()
        });

        let content = match msg.content {
            unified::UnifiedContentContainer::Text(text) => Some(openai::MessageContent::Text(text)),
            unified::UnifiedContentContainer::Blocks(blocks) => blocks_to_content(blocks),
        };

        Self {
            role,
            content,
            name: msg.name,
            tool_calls,
            tool_call_id: msg.tool_call_id,
        }
    }
}

/// Convert unified blocks to OpenAI message content.
///
/// Text-only block sequences collapse to a flat string; multimodal sequences
/// become an array of parts. Thinking blocks are suppressed (the dialect has
/// no reasoning channel on messages) and tool blocks are carried elsewhere.
fn blocks_to_content(blocks: Vec<unified::UnifiedContent>) -> Option<openai::MessageContent> {
    let mut parts = Vec::with_capacity(blocks.len());

    for block in blocks {
        match block {
            unified::UnifiedContent::Text { text, .. } => parts.push(openai::ContentPart::Text { text }),
            unified::UnifiedContent::Image { source, .. } => parts.push(openai::ContentPart::ImageUrl {
                image_url: openai::ImageUrl {
                    url: match source {
                        unified::UnifiedImageSource::Url { url } => url,
                        unified::UnifiedImageSource::Base64 { media_type, data } => {
                            format!("data:{media_type};base64,{data}")
                        }
                    },
                },
            }),
            unified::UnifiedContent::InputAudio { data } => parts.push(openai::ContentPart::InputAudio {
                input_audio: openai::InputAudio { data, format: None },
            }),
            unified::UnifiedContent::File { data, .. } => parts.push(openai::ContentPart::File {
                file: openai::FilePart {
                    file_data: data,
                    filename: None,
                },
            }),
            unified::UnifiedContent::ToolResult { content, .. } => parts.push(openai::ContentPart::Text {
                text: content.joined().into_owned(),
            }),
            unified::UnifiedContent::Thinking { .. } | unified::UnifiedContent::ToolUse { .. } => {}
        }
    }

    if parts.is_empty() {
        return None;
    }

    // Collapse a pure-text sequence into a flat string.
    if parts.iter().all(|p| matches!(p, openai::ContentPart::Text { .. })) {
        let text = parts
            .into_iter()
            .map(|p| match p {
                openai::ContentPart::Text { text } => text,
                _ => unreachable!(),
            })
            .collect::<Vec<_>>()
            .join("\n");

        return Some(openai::MessageContent::Text(text));
    }

    Some(openai::MessageContent::Parts(parts))
}

impl From<unified::UnifiedTool> for openai::Tool {
    fn from(tool: unified::UnifiedTool) -> Self {
        Self {
            tool_type: openai::ToolType::Function,
            function: openai::FunctionDefinition {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters,
            },
        }
    }
}

impl From<unified::UnifiedToolChoiceMode> for openai::ToolChoiceMode {
    fn from(mode: unified::UnifiedToolChoiceMode) -> Self {
        match mode {
            unified::UnifiedToolChoiceMode::None => openai::ToolChoiceMode::None,
            unified::UnifiedToolChoiceMode::Auto => openai::ToolChoiceMode::Auto,
            unified::UnifiedToolChoiceMode::Required => openai::ToolChoiceMode::Required,
        }
    }
}

impl From<unified::UnifiedToolChoice> for openai::ToolChoice {
    fn from(choice: unified::UnifiedToolChoice) -> Self {
        match choice {
            unified::UnifiedToolChoice::Mode(mode) => openai::ToolChoice::Mode(mode.into()),
            unified::UnifiedToolChoice::Specific { function } => openai::ToolChoice::Function {
                choice_type: openai::ToolType::Function,
                function: openai::FunctionChoice { name: function.name },
            },
        }
    }
}

impl From<unified::UnifiedFinishReason> for openai::FinishReason {
    fn from(reason: unified::UnifiedFinishReason) -> Self {
        match reason {
            unified::UnifiedFinishReason::Stop => openai::FinishReason::Stop,
            unified::UnifiedFinishReason::Length => openai::FinishReason::Length,
            unified::UnifiedFinishReason::ContentFilter => openai::FinishReason::ContentFilter,
            unified::UnifiedFinishReason::ToolCalls => openai::FinishReason::ToolCalls,
            unified::UnifiedFinishReason::Error => openai::FinishReason::Other("error".to_string()),
        }
    }
}

impl From<unified::UnifiedResponse> for openai::ChatCompletionResponse {
    fn from(resp: unified::UnifiedResponse) -> Self {
        Self {
            id: resp.id,
            object: openai::ObjectType::ChatCompletion,
            created: resp.created,
            model: resp.model,
            choices: resp
                .choices
                .into_iter()
                .map(|choice| openai::ChatChoice {
                    index: choice.index,
                    message: openai::ChatMessage::from(choice.message),
                    finish_reason: choice.finish_reason.map(openai::FinishReason::from),
                })
                .collect(),
            usage: openai::Usage {
                prompt_tokens: resp.usage.prompt_tokens,
                completion_tokens: resp.usage.completion_tokens,
                total_tokens: resp.usage.total_tokens,
            },
        }
    }
}

impl From<unified::UnifiedStreamingToolCall> for openai::StreamingToolCall {
    fn from(call: unified::UnifiedStreamingToolCall) -> Self {
        match call {
            unified::UnifiedStreamingToolCall::Start { index, id, function } => openai::StreamingToolCall::Start {
                index,
                id,
                tool_type: openai::ToolType::Function,
                function: openai::FunctionStart {
                    name: function.name,
                    arguments: function.arguments,
                },
            },
            unified::UnifiedStreamingToolCall::Delta { index, function } => openai::StreamingToolCall::Delta {
                index,
                function: openai::FunctionDelta {
                    arguments: function.arguments,
                },
            },
        }
    }
}

impl From<unified::UnifiedChunk> for openai::ChatCompletionChunk {
    fn from(chunk: unified::UnifiedChunk) -> Self {
        Self {
            id: chunk.id.into_owned(),
            object: openai::ObjectType::ChatCompletionChunk,
            created: chunk.created,
            model: chunk.model.into_owned(),
            choices: chunk
                .choices
                .into_iter()
                .map(|choice| openai::ChatChoiceDelta {
                    index: choice.index,
                    delta: openai::ChatMessageDelta {
                        role: choice.delta.role.map(openai::ChatRole::from),
                        content: choice.delta.content,
                        reasoning_content: choice.delta.reasoning,
                        tool_calls: choice
                            .delta
                            .tool_calls
                            .map(|calls| calls.into_iter().map(openai::StreamingToolCall::from).collect()),
                    },
                    finish_reason: choice.finish_reason.map(openai::FinishReason::from),
                })
                .collect(),
            usage: chunk.usage.map(|u| openai::Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        }
    }
}

impl From<unified::UnifiedModel> for openai::Model {
    fn from(model: unified::UnifiedModel) -> Self {
        Self {
            id: model.id,
            object: openai::ObjectType::Model,
            created: model.created,
            owned_by: model.owned_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unified_request(messages: Vec<unified::UnifiedMessage>) -> unified::UnifiedRequest {
        unified::UnifiedRequest {
            model: "gpt-4o".to_string(),
            messages,
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
    fn round_trip_preserves_argument_strings() {
        let original: openai::ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather?"},
                {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "f", "arguments": "{ \"city\" : \"Paris\" }"}
                    }]
                }
            ]
        }))
        .unwrap();

        let unified = unified::UnifiedRequest::from(original);
        let back = openai::ChatCompletionRequest::from(unified);

        let calls = back.messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{ \"city\" : \"Paris\" }");
    }

    #[test]
    fn system_is_reemitted_as_first_message() {
        let mut request = unified_request(vec![unified::UnifiedMessage::text(unified::UnifiedRole::User, "Hi")]);
        request.system = Some(unified::SystemContent::Text("Be terse.".to_string()));

        let wire = openai::ChatCompletionRequest::from(request);

        assert_eq!(wire.messages[0].role, openai::ChatRole::System);
        assert!(matches!(
            wire.messages[0].content,
            Some(openai::MessageContent::Text(ref t)) if t == "Be terse."
        ));
    }

    #[test]
    fn text_only_blocks_collapse_to_string() {
        let message = unified::UnifiedMessage {
            role: unified::UnifiedRole::User,
            content: unified::UnifiedContentContainer::Blocks(vec![
                unified::UnifiedContent::Text {
                    text: "a".to_string(),
                    cache_control: None,
                },
                unified::UnifiedContent::Text {
                    text: "b".to_string(),
                    cache_control: None,
                },
            ]),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };

        let wire = openai::ChatMessage::from(message);
        assert!(matches!(
            wire.content,
            Some(openai::MessageContent::Text(ref t)) if t == "a\nb"
        ));
    }

    #[test]
    fn multimodal_blocks_become_parts() {
        let message = unified::UnifiedMessage {
            role: unified::UnifiedRole::User,
            content: unified::UnifiedContentContainer::Blocks(vec![
                unified::UnifiedContent::Text {
                    text: "look".to_string(),
                    cache_control: None,
                },
                unified::UnifiedContent::Image {
                    source: unified::UnifiedImageSource::Base64 {
                        media_type: "image/png".to_string(),
                        data: "aGk=".to_string(),
                    },
                    cache_control: None,
                },
            ]),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };

        let wire = openai::ChatMessage::from(message);
        let Some(openai::MessageContent::Parts(parts)) = wire.content else {
            unreachable!("expected parts");
        };

        assert_eq!(parts.len(), 2);
        let openai::ContentPart::ImageUrl { image_url } = &parts[1] else {
            unreachable!("expected image part");
        };
        assert_eq!(image_url.url, "data:image/png;base64,aGk=");
    }

    #[test]
    fn thinking_blocks_are_suppressed() {
        let message = unified::UnifiedMessage {
            role: unified::UnifiedRole::Assistant,
            content: unified::UnifiedContentContainer::Blocks(vec![
                unified::UnifiedContent::Thinking {
                    thinking: "secret".to_string(),
                    signature: None,
                },
                unified::UnifiedContent::Text {
                    text: "visible".to_string(),
                    cache_control: None,
                },
            ]),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        };

        let wire = openai::ChatMessage::from(message);
        assert!(matches!(
            wire.content,
            Some(openai::MessageContent::Text(ref t)) if t == "visible"
        ));
    }
}
